//! Platform-specific code.
//!
//! At the moment we only target Unix-like systems.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod unix;
    }
}
