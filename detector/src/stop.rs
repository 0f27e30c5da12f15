use tokio::sync::watch;

/// Cooperative stop signal observed by every background worker.
pub type StopSignal = watch::Receiver<bool>;

pub fn stop_channel() -> (watch::Sender<bool>, StopSignal) {
    watch::channel(false)
}

/// Resolves once a stop is requested or the controlling side is dropped.
pub async fn stopped(stop: &mut StopSignal) {
    let _ = stop.wait_for(|requested| *requested).await;
}

pub fn is_stopped(stop: &StopSignal) -> bool {
    *stop.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_on_request() {
        let (tx, mut rx) = stop_channel();
        assert!(!is_stopped(&rx));
        tx.send(true).unwrap();
        stopped(&mut rx).await;
        assert!(is_stopped(&rx));
    }

    #[tokio::test]
    async fn resolves_when_controller_dropped() {
        let (tx, mut rx) = stop_channel();
        drop(tx);
        stopped(&mut rx).await;
    }
}
