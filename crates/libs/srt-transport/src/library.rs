//! Reference-counted SRT library service
//!
//! The SRT library keeps process-wide state that must be started before the
//! first socket is created and torn down after the last one is closed. Every
//! open endpoint holds one reference.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::{SrtApi, TransportError};

/// Shared handle to an SRT implementation plus its start/stop bookkeeping
pub struct SrtLibrary {
    api: Arc<dyn SrtApi>,
    users: Mutex<usize>,
}

impl SrtLibrary {
    pub fn new(api: Arc<dyn SrtApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            users: Mutex::new(0),
        })
    }

    /// The process-wide libsrt instance
    #[cfg(feature = "libsrt")]
    pub fn global() -> Arc<Self> {
        static GLOBAL: std::sync::OnceLock<Arc<SrtLibrary>> = std::sync::OnceLock::new();
        GLOBAL
            .get_or_init(|| SrtLibrary::new(Arc::new(crate::ffi::LibSrt::new())))
            .clone()
    }

    /// Register a user, starting the library on the first one
    pub fn acquire(&self) -> Result<(), TransportError> {
        let mut users = self.users.lock();
        if *users == 0 {
            self.api.startup()?;
            tracing::debug!("SRT library started");
        }
        *users += 1;
        Ok(())
    }

    /// Unregister a user, stopping the library after the last one
    pub fn release(&self) {
        let mut users = self.users.lock();
        match *users {
            0 => {}
            1 => {
                *users = 0;
                self.api.cleanup();
                tracing::debug!("SRT library stopped");
            }
            _ => *users -= 1,
        }
    }

    /// Number of endpoints currently holding the library
    pub fn users(&self) -> usize {
        *self.users.lock()
    }

    pub fn api(&self) -> &dyn SrtApi {
        self.api.as_ref()
    }
}

impl std::fmt::Debug for SrtLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtLibrary")
            .field("users", &self.users())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSrt;

    #[test]
    fn test_starts_once_and_stops_after_last_user() {
        let mock = MockSrt::new();
        let library = SrtLibrary::new(mock.clone());

        library.acquire().unwrap();
        library.acquire().unwrap();
        assert_eq!(mock.startups(), 1);
        assert_eq!(library.users(), 2);

        library.release();
        assert_eq!(mock.cleanups(), 0);

        library.release();
        assert_eq!(mock.cleanups(), 1);
        assert_eq!(library.users(), 0);
    }

    #[test]
    fn test_release_without_users_is_noop() {
        let mock = MockSrt::new();
        let library = SrtLibrary::new(mock.clone());

        library.release();
        assert_eq!(mock.cleanups(), 0);

        library.acquire().unwrap();
        library.release();
        library.release();
        assert_eq!(mock.startups(), 1);
        assert_eq!(mock.cleanups(), 1);
    }

    #[test]
    fn test_restart_after_full_release() {
        let mock = MockSrt::new();
        let library = SrtLibrary::new(mock.clone());

        library.acquire().unwrap();
        library.release();
        library.acquire().unwrap();
        assert_eq!(mock.startups(), 2);
    }

    #[test]
    fn test_failed_startup_is_not_counted() {
        let mock = MockSrt::new();
        mock.fail_startup();
        let library = SrtLibrary::new(mock.clone());

        assert!(library.acquire().is_err());
        assert_eq!(library.users(), 0);
    }
}
