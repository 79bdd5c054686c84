//! Crate-internal logging shims. With the `defmt` feature the macros
//! forward to `defmt`, without it they compile away, so the host test
//! build does not need a logger at link time.

macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        ::defmt::debug!($($args)*)
    };
}

macro_rules! warn {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        ::defmt::warn!($($args)*)
    };
}

pub(crate) use {debug, warn};
