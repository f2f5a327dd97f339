//! QR-code login progress
//!
//! A QR login runs in the background and reports its progress through a
//! [`QrLoginProgressPublisher`]. Progress only moves forward:
//!
//! ```text
//! Starting -> EstablishingSecureChannel -> WaitingForToken -> SignedIn
//!        \______________________|___________________|______-> error
//! ```
//!
//! The publisher replays the latest event to late observers. Once a
//! terminal event (signed in or error) has been published nothing else is.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::client::{HumanQrLoginError, QrLoginProgressListener, QrLoginProgressUpdate};
use crate::error::{AuthenticationError, QrCodeErrorKind};
use crate::session::UserSession;

/// Observable step of a QR login
#[derive(Debug, Clone)]
pub enum QrLoginProgress {
    Starting,
    /// Both devices should display `check_code_string`
    EstablishingSecureChannel {
        check_code: u8,
        check_code_string: String,
    },
    /// The user must confirm `user_code` on the other device
    WaitingForToken {
        user_code: String,
    },
    SignedIn(UserSession),
}

impl QrLoginProgress {
    /// Map a handler update, dropping the ones that are not user visible
    pub fn from_update(update: &QrLoginProgressUpdate) -> Option<Self> {
        match update {
            QrLoginProgressUpdate::Starting => Some(QrLoginProgress::Starting),
            QrLoginProgressUpdate::EstablishingSecureChannel {
                check_code,
                check_code_string,
            } => Some(QrLoginProgress::EstablishingSecureChannel {
                check_code: *check_code,
                check_code_string: check_code_string.clone(),
            }),
            QrLoginProgressUpdate::WaitingForToken { user_code } => {
                Some(QrLoginProgress::WaitingForToken {
                    user_code: user_code.clone(),
                })
            }
            QrLoginProgressUpdate::SyncingSecrets | QrLoginProgressUpdate::Done => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            QrLoginProgress::Starting => 0,
            QrLoginProgress::EstablishingSecureChannel { .. } => 1,
            QrLoginProgress::WaitingForToken { .. } => 2,
            QrLoginProgress::SignedIn(_) => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QrLoginProgress::SignedIn(_))
    }
}

/// Latest state of a QR login: progress, or the error that ended it
pub type QrLoginEvent = Result<QrLoginProgress, AuthenticationError>;

/// Map a handler failure to the error taxonomy
pub fn map_qr_login_error(error: &HumanQrLoginError) -> AuthenticationError {
    let kind = match error {
        HumanQrLoginError::Cancelled => QrCodeErrorKind::Cancelled,
        HumanQrLoginError::ConnectionInsecure => QrCodeErrorKind::ConnectionInsecure,
        HumanQrLoginError::Declined => QrCodeErrorKind::Declined,
        HumanQrLoginError::LinkingNotSupported => QrCodeErrorKind::LinkingNotSupported,
        HumanQrLoginError::Expired => QrCodeErrorKind::Expired,
        HumanQrLoginError::SlidingSyncNotAvailable => QrCodeErrorKind::DeviceNotSupported,
        HumanQrLoginError::OtherDeviceNotSignedIn => QrCodeErrorKind::DeviceNotSignedIn,
        HumanQrLoginError::Unknown
        | HumanQrLoginError::NotFound
        | HumanQrLoginError::OidcMetadataInvalid
        | HumanQrLoginError::CheckCodeAlreadySent
        | HumanQrLoginError::CheckCodeCannotBeSent => QrCodeErrorKind::Unknown,
    };
    AuthenticationError::QrCode(kind)
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Observer side of a QR login
#[derive(Debug, Clone)]
pub struct QrLoginProgressPublisher {
    rx: watch::Receiver<QrLoginEvent>,
}

impl QrLoginProgressPublisher {
    /// Latest event
    pub fn current(&self) -> QrLoginEvent {
        self.rx.borrow().clone()
    }

    /// Wait for the next event
    ///
    /// Returns `false` once the login has stopped producing events.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Stream of events, starting with the latest one
    pub fn into_stream(self) -> WatchStream<QrLoginEvent> {
        WatchStream::new(self.rx)
    }

    /// Wait for the login to finish
    ///
    /// # Errors
    ///
    /// Returns the error that ended the login, or
    /// `QrCode(Unknown)` if the login stopped without a terminal event.
    pub async fn wait_for_completion(mut self) -> Result<UserSession, AuthenticationError> {
        loop {
            match &*self.rx.borrow_and_update() {
                Ok(QrLoginProgress::SignedIn(session)) => return Ok(session.clone()),
                Err(error) => return Err(error.clone()),
                Ok(_) => {}
            }
            if self.rx.changed().await.is_err() {
                return match &*self.rx.borrow() {
                    Ok(QrLoginProgress::SignedIn(session)) => Ok(session.clone()),
                    Err(error) => Err(error.clone()),
                    Ok(_) => Err(AuthenticationError::QrCode(QrCodeErrorKind::Unknown)),
                };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SinkState {
    rank: u8,
    finished: bool,
}

/// Producer side of a QR login, enforcing forward-only progress
#[derive(Debug)]
pub struct QrProgressSink {
    tx: watch::Sender<QrLoginEvent>,
    state: Mutex<SinkState>,
}

impl QrProgressSink {
    /// Create a sink starting at [`QrLoginProgress::Starting`]
    pub fn new() -> (Arc<Self>, QrLoginProgressPublisher) {
        let (tx, rx) = watch::channel(Ok(QrLoginProgress::Starting));
        let sink = Arc::new(Self {
            tx,
            state: Mutex::new(SinkState::default()),
        });
        (sink, QrLoginProgressPublisher { rx })
    }

    /// Publish a progress step
    ///
    /// Steps behind the current one, and anything after a terminal event,
    /// are dropped.
    pub fn progress(&self, progress: QrLoginProgress) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.finished {
            tracing::debug!("Dropping QR login progress after completion: {:?}", progress);
            return;
        }
        let rank = progress.rank();
        if rank < state.rank {
            tracing::debug!("Dropping out-of-order QR login progress: {:?}", progress);
            return;
        }
        state.rank = rank;
        state.finished = progress.is_terminal();
        self.tx.send_replace(Ok(progress));
    }

    /// Publish the error that ends the login
    pub fn fail(&self, error: AuthenticationError) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.finished {
            tracing::debug!("Dropping QR login error after completion: {}", error);
            return;
        }
        tracing::error!("QR code login failed: {}", error);
        state.finished = true;
        self.tx.send_replace(Err(error));
    }
}

impl QrLoginProgressListener for QrProgressSink {
    fn on_update(&self, update: QrLoginProgressUpdate) {
        if let Some(progress) = QrLoginProgress::from_update(&update) {
            self.progress(progress);
        }
    }
}
