//! 32-bit x86 support: the context switch and the user-program jump

pub mod context;
