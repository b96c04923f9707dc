use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// The leadership terms this instance holds, as seen by whatever only runs
/// while leading. Watches and caches never look at it.
#[derive(Clone)]
pub struct Terms {
    rx: watch::Receiver<Option<CancellationToken>>,
}

/// Announces each term won by the elector
pub struct TermPublisher {
    tx: watch::Sender<Option<CancellationToken>>,
}

impl Terms {
    pub fn new() -> (Terms, TermPublisher) {
        let (tx, rx) = watch::channel(None);
        (Terms { rx }, TermPublisher { tx })
    }

    /// A single term lasting until `term` is cancelled
    pub fn single(term: CancellationToken) -> Self {
        let (_, rx) = watch::channel(Some(term));
        Terms { rx }
    }

    /// Waits for a live term. None once `shutdown` is cancelled.
    pub async fn next(&mut self, shutdown: &CancellationToken) -> Option<CancellationToken> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(term) = current {
                if !term.is_cancelled() {
                    return Some(term);
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // no publisher left, so no further terms
                        shutdown.cancelled().await;
                        return None;
                    }
                }
            }
        }
    }
}

impl TermPublisher {
    pub fn publish(&self, term: CancellationToken) {
        self.tx.send_replace(Some(term));
    }

    pub fn withdraw(&self) {
        self.tx.send_replace(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waits_for_a_live_term() {
        let shutdown = CancellationToken::new();
        let (mut terms, publisher) = Terms::new();

        let pending = tokio::time::timeout(Duration::from_millis(20), terms.next(&shutdown)).await;
        assert!(pending.is_err());

        let first = shutdown.child_token();
        publisher.publish(first.clone());
        let got = terms.next(&shutdown).await.unwrap();
        first.cancel();
        assert!(got.is_cancelled());

        // a cancelled term is never handed out again
        let pending = tokio::time::timeout(Duration::from_millis(20), terms.next(&shutdown)).await;
        assert!(pending.is_err());

        let second = shutdown.child_token();
        publisher.publish(second.clone());
        assert!(!terms.next(&shutdown).await.unwrap().is_cancelled());

        shutdown.cancel();
        assert!(terms.next(&shutdown).await.is_none());
    }

    #[tokio::test]
    async fn no_publisher_means_no_terms_until_shutdown() {
        let shutdown = CancellationToken::new();
        let (mut terms, publisher) = Terms::new();
        drop(publisher);

        let pending = tokio::time::timeout(Duration::from_millis(20), terms.next(&shutdown)).await;
        assert!(pending.is_err());

        shutdown.cancel();
        assert!(terms.next(&shutdown).await.is_none());
    }
}
