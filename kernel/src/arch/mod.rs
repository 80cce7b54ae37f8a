/// Platform support for the freestanding target.
pub mod x86_64;
