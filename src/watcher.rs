use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Bridges the per-call cancellation token to connection-level abort.
///
/// A watched token is consulted at every packet boundary: wire futures run
/// through [`guard`], which drops the in-flight read or write the moment the
/// token fires and surfaces [`Error::Canceled`]. The connection is then
/// marked `Closed`, so the torn stream can never be reused. Timeouts are the
/// same mechanism with a timer cancelling the token.
#[derive(Debug, Default)]
pub struct ContextWatcher {
    token: Option<CancellationToken>,
}

impl ContextWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token; a re-entrant watch replaces the previous one.
    pub fn watch(&mut self, token: &CancellationToken) {
        self.token = Some(token.clone());
    }

    /// Detaches the current token; a no-op when nothing is watched.
    pub fn unwatch(&mut self) {
        self.token = None;
    }

    pub fn is_watching(&self) -> bool {
        self.token.is_some()
    }

    /// Clone of the watched token, for racing outside `&mut self` borrows.
    pub fn current(&self) -> Option<CancellationToken> {
        self.token.clone()
    }
}

/// Races a wire future against the watched token.
pub(crate) async fn guard<T>(
    token: Option<CancellationToken>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match token {
        None => fut.await,
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Canceled),
                result = fut => result,
            }
        }
    }
}
