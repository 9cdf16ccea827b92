//! Providing PKCS#11 sessions to token operations.
//!
//! A [`SessionProvider`] either hands out one long-lived session guarded
//! by a mutex, or a session from a bounded pool of sessions that are
//! logged in when they are created.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use secrecy::SecretString;

use crate::commons::error::{Error, ErrorKind};
use crate::commons::{SignerEmptyResult, SignerResult};
use crate::signer::pins::PinVault;


//------------ SessionOpener -------------------------------------------------

/// Opens sessions with a single token.
pub trait SessionOpener: fmt::Debug + Send + Sync + 'static {
    type Session: Send + 'static;

    fn open(&self) -> SignerResult<Self::Session>;

    fn login(
        &self, session: &Self::Session, pin: &SecretString
    ) -> SignerEmptyResult;

    /// Checks with a cheap device round-trip that a session still works.
    fn check_alive(&self, session: &Self::Session) -> SignerEmptyResult;
}


//------------ SessionProvider -----------------------------------------------

pub enum SessionProvider<O: SessionOpener> {
    /// One session opened on first use, access is serialized.
    Single {
        opener: Arc<O>,
        session: Mutex<Option<O::Session>>,
    },

    /// A fixed size pool of logged in sessions.
    Pooled {
        token_id: String,
        timeout: Duration,
        pool: r2d2::Pool<PoolManager<O>>,
    },
}

impl<O: SessionOpener> SessionProvider<O> {
    pub fn single(opener: Arc<O>) -> Self {
        SessionProvider::Single { opener, session: Mutex::new(None) }
    }

    /// Creates a pool and fills it with `size` logged in sessions.
    ///
    /// Fails right away if there is no PIN for the token and fails if not
    /// all sessions can be created within `timeout`.
    pub fn pooled(
        token_id: &str,
        opener: Arc<O>,
        pins: Arc<PinVault>,
        size: u32,
        timeout: Duration,
    ) -> SignerResult<Self> {
        if !pins.contains(token_id) {
            return Err(Error::TokenNotActive(token_id.to_string()))
        }
        let manager = PoolManager {
            token_id: token_id.to_string(),
            opener,
            pins,
        };
        let pool = r2d2::Pool::builder()
            .max_size(size)
            .min_idle(Some(size))
            .connection_timeout(timeout)
            .test_on_check_out(true)
            .build(manager)
            .map_err(|err| Error::device("create session pool", err))?;
        info!("[{token_id}] Created session pool with {size} sessions");
        Ok(SessionProvider::Pooled {
            token_id: token_id.to_string(),
            timeout,
            pool,
        })
    }

    /// Runs an operation with a session.
    ///
    /// A single session that failed with a device error is closed and
    /// reopened on next use. Pooled sessions are checked on every borrow.
    pub fn with_session<R>(
        &self, op: impl FnOnce(&O::Session) -> SignerResult<R>
    ) -> SignerResult<R> {
        match self {
            SessionProvider::Single { opener, session } => {
                let mut guard = session.lock()
                    .unwrap_or_else(|err| err.into_inner());
                let current = match guard.take() {
                    Some(current) => current,
                    None => opener.open()?,
                };
                let res = op(&current);
                match &res {
                    Err(err) if err.kind() == ErrorKind::DeviceError => {
                        warn!("Closing session after device error: {err}");
                    }
                    _ => *guard = Some(current),
                }
                res
            }
            SessionProvider::Pooled { token_id, timeout, pool } => {
                let conn = pool.get().map_err(|err| {
                    debug!("[{token_id}] Session pool: {err}");
                    Error::SessionPoolExhausted {
                        token_id: token_id.clone(),
                        timeout: *timeout,
                    }
                })?;
                op(&conn)
            }
        }
    }

    /// Closes a single session.
    pub fn close(&self) {
        if let SessionProvider::Single { session, .. } = self {
            session.lock().unwrap_or_else(|err| err.into_inner()).take();
        }
    }

    /// Returns the number of sessions currently open.
    pub fn open_sessions(&self) -> u32 {
        match self {
            SessionProvider::Single { session, .. } => {
                let guard = session.lock()
                    .unwrap_or_else(|err| err.into_inner());
                u32::from(guard.is_some())
            }
            SessionProvider::Pooled { pool, .. } => pool.state().connections,
        }
    }
}

impl<O: SessionOpener> fmt::Debug for SessionProvider<O> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionProvider::Single { .. } => f.write_str("Single"),
            SessionProvider::Pooled { token_id, .. } => {
                write!(f, "Pooled({token_id})")
            }
        }
    }
}


//------------ PoolManager ---------------------------------------------------

/// Creates and checks pooled sessions for r2d2.
#[derive(Debug)]
pub struct PoolManager<O> {
    token_id: String,
    opener: Arc<O>,
    pins: Arc<PinVault>,
}

impl<O: SessionOpener> r2d2::ManageConnection for PoolManager<O> {
    type Connection = O::Session;
    type Error = Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let pin = self.pins.get(&self.token_id).ok_or_else(|| {
            Error::TokenNotActive(self.token_id.clone())
        })?;
        let session = self.opener.open()?;
        self.opener.login(&session, &pin)?;
        debug!("[{}] Opened pooled session", self.token_id);
        Ok(session)
    }

    fn is_valid(
        &self, session: &mut Self::Connection
    ) -> Result<(), Self::Error> {
        self.opener.check_alive(session)
    }

    fn has_broken(&self, _session: &mut Self::Connection) -> bool {
        false
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::commons::test::pin;

    const TOKEN: &str = "mock-0";

    #[derive(Debug, Default)]
    struct MockOpener {
        next_id: AtomicU32,
        opened: AtomicUsize,
        logins: AtomicUsize,
        fail_login: AtomicBool,
        broken: Mutex<HashSet<u32>>,
    }

    impl MockOpener {
        fn break_all_opened(&self) {
            let opened = self.next_id.load(Ordering::SeqCst);
            self.broken.lock().unwrap().extend(0..opened);
        }
    }

    impl SessionOpener for MockOpener {
        type Session = u32;

        fn open(&self) -> SignerResult<u32> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        fn login(
            &self, _session: &u32, _pin: &SecretString
        ) -> SignerEmptyResult {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.fail_login.load(Ordering::SeqCst) {
                Err(Error::device("login", "CKR_DEVICE_ERROR"))
            }
            else {
                Ok(())
            }
        }

        fn check_alive(&self, session: &u32) -> SignerEmptyResult {
            if self.broken.lock().unwrap().contains(session) {
                Err(Error::device("check session", "CKR_SESSION_HANDLE_INVALID"))
            }
            else {
                Ok(())
            }
        }
    }

    fn pins_with_pin() -> Arc<PinVault> {
        let pins = Arc::new(PinVault::new());
        pins.set(TOKEN, pin("1234"));
        pins
    }

    fn pool(
        opener: &Arc<MockOpener>, size: u32, timeout: Duration
    ) -> SignerResult<SessionProvider<MockOpener>> {
        SessionProvider::pooled(
            TOKEN, opener.clone(), pins_with_pin(), size, timeout
        )
    }

    #[test]
    fn pool_is_prefilled() {
        let opener = Arc::new(MockOpener::default());
        let provider = pool(&opener, 3, Duration::from_secs(5)).unwrap();
        assert_eq!(opener.opened.load(Ordering::SeqCst), 3);
        assert_eq!(opener.logins.load(Ordering::SeqCst), 3);
        assert_eq!(provider.open_sessions(), 3);
    }

    #[test]
    fn pool_needs_pin() {
        let opener = Arc::new(MockOpener::default());
        let err = SessionProvider::pooled(
            TOKEN, opener.clone(), Arc::new(PinVault::new()),
            3, Duration::from_secs(5),
        ).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenNotActive);
        assert_eq!(opener.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pool_creation_fails_on_login_failure() {
        let opener = Arc::new(MockOpener::default());
        opener.fail_login.store(true, Ordering::SeqCst);
        let err = pool(&opener, 2, Duration::from_millis(200)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceError);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let opener = Arc::new(MockOpener::default());
        let timeout = Duration::from_millis(200);
        let provider = pool(&opener, 2, timeout).unwrap();

        provider.with_session(|first| {
            provider.with_session(|second| {
                assert_ne!(first, second);
                let start = Instant::now();
                let err = provider.with_session(|_| Ok(())).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::SessionPoolExhausted);
                assert!(start.elapsed() >= timeout);
                Ok(())
            })
        }).unwrap();

        // Returned sessions are usable again.
        provider.with_session(|_| Ok(())).unwrap();
        assert_eq!(opener.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn borrowed_sessions_never_exceed_capacity() {
        let opener = Arc::new(MockOpener::default());
        let provider = Arc::new(
            pool(&opener, 3, Duration::from_secs(10)).unwrap()
        );
        let in_use = Arc::new(AtomicUsize::new(0));
        let max_in_use = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8).map(|_| {
            let provider = provider.clone();
            let in_use = in_use.clone();
            let max_in_use = max_in_use.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..10 {
                    provider.with_session(|_| {
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_use.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        in_use.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }).unwrap();
                }
            })
        }).collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(max_in_use.load(Ordering::SeqCst) <= 3);
        assert_eq!(opener.opened.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn invalid_sessions_are_replaced() {
        let opener = Arc::new(MockOpener::default());
        let provider = pool(&opener, 2, Duration::from_secs(5)).unwrap();
        opener.break_all_opened();

        let used = provider.with_session(|session| Ok(*session)).unwrap();
        assert!(used >= 2);
        assert!(opener.opened.load(Ordering::SeqCst) > 2);
    }

    #[test]
    fn single_session_is_reused_until_device_error() {
        let opener = Arc::new(MockOpener::default());
        let provider = SessionProvider::single(opener.clone());
        assert_eq!(provider.open_sessions(), 0);

        let first = provider.with_session(|session| Ok(*session)).unwrap();
        let again = provider.with_session(|session| Ok(*session)).unwrap();
        assert_eq!(first, again);
        assert_eq!(opener.logins.load(Ordering::SeqCst), 0);

        let err = provider.with_session(|_| -> SignerResult<()> {
            Err(Error::device("sign", "CKR_DEVICE_REMOVED"))
        }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceError);
        assert_eq!(provider.open_sessions(), 0);

        let next = provider.with_session(|session| Ok(*session)).unwrap();
        assert_ne!(first, next);

        provider.close();
        assert_eq!(provider.open_sessions(), 0);
    }
}
