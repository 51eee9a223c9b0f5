//! Platform-specific type aliases and trait bounds
//!
//! This module provides conditional compilation for single-threaded (Rc-based)
//! vs multi-threaded (Arc-based) implementations.
//!
//! - `send` feature (default): Uses Arc and requires Send+Sync bounds
//! - `local` feature: Uses Rc and removes Send+Sync requirements

#[cfg(all(feature = "send", feature = "local"))]
compile_error!("features `send` and `local` are mutually exclusive");

#[cfg(not(any(feature = "send", feature = "local")))]
compile_error!("one of the features `send` or `local` must be enabled");

// ============================================================================
// MULTI-THREADED (send feature - default)
// ============================================================================
#[cfg(feature = "send")]
pub use std::sync::{Arc as SharedPtr, Weak as SharedWeak};

#[cfg(feature = "send")]
pub trait MaybeSend: Send {}
#[cfg(feature = "send")]
impl<T: Send> MaybeSend for T {}

#[cfg(feature = "send")]
pub trait MaybeSync: Sync {}
#[cfg(feature = "send")]
impl<T: Sync> MaybeSync for T {}

/// Driver futures handed to the host's spawn function.
#[cfg(feature = "send")]
pub type PlatformBoxFutureStatic<T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'static>>;

/// Settlement callbacks registered on a [`Deferred`](crate::Deferred).
#[cfg(feature = "send")]
pub type BoxedCallback<T> = Box<dyn FnOnce(&T) + Send + 'static>;

#[cfg(feature = "send")]
pub type BoxedStrategy = Box<dyn crate::streams::QueuingStrategy + Send + Sync + 'static>;

// ============================================================================
// SINGLE-THREADED (local feature)
// ============================================================================
#[cfg(feature = "local")]
pub use std::rc::{Rc as SharedPtr, Weak as SharedWeak};

#[cfg(feature = "local")]
pub trait MaybeSend {}
#[cfg(feature = "local")]
impl<T> MaybeSend for T {}

#[cfg(feature = "local")]
pub trait MaybeSync {}
#[cfg(feature = "local")]
impl<T> MaybeSync for T {}

#[cfg(feature = "local")]
pub type PlatformBoxFutureStatic<T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + 'static>>;

#[cfg(feature = "local")]
pub type BoxedCallback<T> = Box<dyn FnOnce(&T) + 'static>;

#[cfg(feature = "local")]
pub type BoxedStrategy = Box<dyn crate::streams::QueuingStrategy + 'static>;
