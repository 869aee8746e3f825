use crate::hns::{HnsError, HostComputeNetwork, HostNetworkService, ModifyNetworkSettingsRequest};
use std::sync::{
    mpsc::{self, RecvTimeoutError},
    Arc,
};
use std::time::Duration;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Arms a per-call deadline around every host-network-service call.
///
/// The call runs on its own thread and publishes its result on a channel; the
/// wrapper returns whichever comes first, the result or the deadline. On the
/// deadline the distinct `HnsError::Timeout` sentinel is returned and the
/// orphaned call is abandoned, not cancelled — it may still complete, and its
/// result is dropped with the channel.
pub struct TimedHns<S> {
    inner: Arc<S>,
    timeout: Duration,
}

// === impl TimedHns ===

impl<S> TimedHns<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl<S: HostNetworkService + 'static> TimedHns<S> {
    fn call<T: Send + 'static>(
        &self,
        f: impl FnOnce(&S) -> Result<T, HnsError> + Send + 'static,
    ) -> Result<T, HnsError> {
        let (tx, rx) = mpsc::channel();
        let inner = self.inner.clone();
        std::thread::spawn(move || {
            // The receiver may be gone by the time this finishes.
            let _ = tx.send(f(&inner));
        });
        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(HnsError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(HnsError::Call("host network service worker vanished".to_string()))
            }
        }
    }
}

impl<S: HostNetworkService + 'static> HostNetworkService for TimedHns<S> {
    fn get_network_by_name(&self, name: &str) -> Result<HostComputeNetwork, HnsError> {
        let name = name.to_string();
        self.call(move |hns| hns.get_network_by_name(&name))
    }

    fn modify_network_settings(
        &self,
        network_id: &str,
        request: &ModifyNetworkSettingsRequest,
    ) -> Result<(), HnsError> {
        let network_id = network_id.to_string();
        let request = request.clone();
        self.call(move |hns| hns.modify_network_settings(&network_id, &request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowHns(Duration);

    impl HostNetworkService for SlowHns {
        fn get_network_by_name(&self, name: &str) -> Result<HostComputeNetwork, HnsError> {
            std::thread::sleep(self.0);
            Ok(HostComputeNetwork {
                id: "net-1".to_string(),
                name: name.to_string(),
                policies: Vec::new(),
            })
        }

        fn modify_network_settings(
            &self,
            _network_id: &str,
            _request: &ModifyNetworkSettingsRequest,
        ) -> Result<(), HnsError> {
            std::thread::sleep(self.0);
            Ok(())
        }
    }

    #[test]
    fn fast_calls_pass_through() {
        let hns = TimedHns::new(SlowHns(Duration::from_millis(0)));
        let network = hns.get_network_by_name("azure").unwrap();
        assert_eq!(network.id, "net-1");
        assert_eq!(network.name, "azure");
    }

    #[test]
    fn slow_calls_surface_the_timeout_sentinel() {
        let hns =
            TimedHns::new(SlowHns(Duration::from_secs(5))).with_timeout(Duration::from_millis(10));
        assert!(matches!(
            hns.get_network_by_name("azure"),
            Err(HnsError::Timeout)
        ));
    }
}
