use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use anyhow::Result;
use serde::ser::{Serialize, SerializeMap, Serializer};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::message::{AvailabilityMessage, Envelope, Message, MessageKind};
use shared::protocol::MAX_HOSTS_PER_SERVICE;
use shared::types::ServiceAddress;
use super::{lock, Accepts, Hooks, MessageProcessor};

/// One `(service, address)` pair entering or leaving the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub service: String,
    pub address: ServiceAddress,
    pub available: bool,
}

impl Transition {
    /// Service identifier with the port suffix restored, e.g. `web:80`
    pub fn label(&self) -> String {
        format!("{}{}", self.service, self.address.port())
    }
}

/// A service endpoint together with the host alias assigned to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub service: String,
    pub hostname: String,
    pub address: ServiceAddress,
}

/// Host to labels, in order of first appearance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostTable {
    entries: Vec<(String, Vec<String>)>,
}

impl HostTable {
    /// Append `label` to `host`, ignoring exact duplicates
    pub fn add(&mut self, host: &str, label: String) {
        match self.entries.iter_mut().find(|(h, _)| h == host) {
            Some((_, labels)) => {
                if !labels.contains(&label) {
                    labels.push(label);
                }
            }
            None => self.entries.push((host.to_string(), vec![label])),
        }
    }

    pub fn get(&self, host: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, labels)| labels.as_slice())
    }

    pub fn contains_host(&self, host: &str) -> bool {
        self.get(host).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(h, labels)| (h.as_str(), labels.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for HostTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (host, labels) in &self.entries {
            map.serialize_entry(host, labels)?;
        }
        map.end()
    }
}

#[derive(Default)]
struct Tables {
    /// service -> addresses, both in order of first observation
    available: Vec<(String, Vec<ServiceAddress>)>,
    /// service -> address -> deadline, coordinator only
    expires: Option<HashMap<String, HashMap<ServiceAddress, Instant>>>,
}

impl Tables {
    fn addresses(&self, service: &str) -> Option<&Vec<ServiceAddress>> {
        self.available
            .iter()
            .find(|(s, _)| s == service)
            .map(|(_, addrs)| addrs)
    }

    /// Returns true if the pair was absent
    fn insert(&mut self, service: &str, address: &ServiceAddress) -> bool {
        match self.available.iter_mut().find(|(s, _)| s == service) {
            Some((_, addrs)) if addrs.contains(address) => false,
            Some((_, addrs)) => {
                addrs.push(address.clone());
                true
            }
            None => {
                self.available.push((service.to_string(), vec![address.clone()]));
                true
            }
        }
    }

    /// Returns true if the pair was present
    fn remove(&mut self, service: &str, address: &ServiceAddress) -> bool {
        let Some(idx) = self.available.iter().position(|(s, _)| s == service) else {
            return false;
        };

        let addrs = &mut self.available[idx].1;
        let before = addrs.len();
        addrs.retain(|a| a != address);
        let removed = addrs.len() != before;

        if addrs.is_empty() {
            self.available.remove(idx);
        }
        removed
    }

    fn forget_expiry(&mut self, service: &str, address: &ServiceAddress) {
        if let Some(expires) = self.expires.as_mut() {
            if let Some(by_address) = expires.get_mut(service) {
                by_address.remove(address);
                if by_address.is_empty() {
                    expires.remove(service);
                }
            }
        }
    }
}

struct ChangeSignal {
    pending: AtomicBool,
    notify: Notify,
}

impl ChangeSignal {
    /// Schedule a notification unless one is already pending
    fn raise(&self) {
        if !self.pending.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }
}

type ChangedCallback = Arc<dyn Fn(&AvailabilityProcessor) + Send + Sync>;

/// Tracks which addresses serve which services.
///
/// With expiry tracking (coordinator mode) every claim carries a deadline
/// refreshed by each availability message; [`expired`](Self::expired)
/// drops claims whose deadline has passed.
///
/// Changes can be observed two ways: a synchronous callback fired after
/// every message that changed the table, or a debounced
/// [`ChangeNotifier`] task.
pub struct AvailabilityProcessor {
    tables: Mutex<Tables>,
    hooks: Hooks<Vec<Transition>>,
    availability_changed: RwLock<Option<ChangedCallback>>,
    signal: RwLock<Option<Arc<ChangeSignal>>>,
}

impl AvailabilityProcessor {
    pub fn new(track_expiry: bool) -> Self {
        Self {
            tables: Mutex::new(Tables {
                available: Vec::new(),
                expires: track_expiry.then(HashMap::new),
            }),
            hooks: Hooks::default(),
            availability_changed: RwLock::new(None),
            signal: RwLock::new(None),
        }
    }

    /// The post hook receives the transitions each message caused
    pub fn hooks(&self) -> &Hooks<Vec<Transition>> {
        &self.hooks
    }

    pub fn tracks_expiry(&self) -> bool {
        lock(&self.tables).expires.is_some()
    }

    /// Called synchronously after every message that changed the table
    pub fn set_availability_changed(
        &self,
        callback: impl Fn(&AvailabilityProcessor) + Send + Sync + 'static,
    ) {
        *self
            .availability_changed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Create the debounced notifier for this processor. Any earlier
    /// notifier stops receiving changes.
    pub fn change_notifier(self: &Arc<Self>, window: Duration) -> ChangeNotifier {
        let signal = Arc::new(ChangeSignal {
            pending: AtomicBool::new(false),
            notify: Notify::new(),
        });
        *self.signal.write().unwrap_or_else(PoisonError::into_inner) = Some(signal.clone());

        ChangeNotifier {
            processor: self.clone(),
            signal,
            window,
        }
    }

    fn apply(&self, msg: &AvailabilityMessage) -> Vec<Transition> {
        let now = Instant::now();
        let mut transitions = Vec::new();

        {
            let mut tables = lock(&self.tables);
            for (service, address) in msg.endpoints() {
                if msg.available {
                    if tables.insert(service, &address) {
                        transitions.push(Transition {
                            service: service.to_string(),
                            address: address.clone(),
                            available: true,
                        });
                    }

                    if tables.expires.is_some() {
                        match now.checked_add(Duration::from_secs(msg.ttl.into())) {
                            Some(deadline) => {
                                if let Some(expires) = tables.expires.as_mut() {
                                    expires
                                        .entry(service.to_string())
                                        .or_default()
                                        .insert(address, deadline);
                                }
                            }
                            // too far out to represent, treat as permanent
                            None => tables.forget_expiry(service, &address),
                        }
                    }
                } else {
                    if tables.remove(service, &address) {
                        transitions.push(Transition {
                            service: service.to_string(),
                            address: address.clone(),
                            available: false,
                        });
                    }
                    tables.forget_expiry(service, &address);
                }
            }
        }

        if !transitions.is_empty() {
            self.changed();
        }
        transitions
    }

    /// Signal a change made outside `process`, e.g. after an expiry sweep
    pub fn mark_changed(&self) {
        self.changed();
    }

    fn changed(&self) {
        let signal = self.signal.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(signal) = signal {
            signal.raise();
        }

        let callback = self
            .availability_changed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    /// Addresses currently serving `service`, in order of first observation
    pub fn available(&self, service: &str) -> Vec<ServiceAddress> {
        lock(&self.tables)
            .addresses(service)
            .cloned()
            .unwrap_or_default()
    }

    /// Every service with at least one address
    pub fn services(&self) -> Vec<String> {
        lock(&self.tables)
            .available
            .iter()
            .map(|(s, _)| s.clone())
            .collect()
    }

    /// Raw copy of the availability table
    pub fn snapshot(&self) -> Vec<(String, Vec<ServiceAddress>)> {
        lock(&self.tables).available.clone()
    }

    /// Visit every address with its 0-based position within the service.
    /// Each port on a host is a separate address with its own position.
    fn walk(&self, mut visit: impl FnMut(&str, usize, &ServiceAddress)) {
        let tables = lock(&self.tables);
        for (service, addrs) in &tables.available {
            for (idx, address) in addrs.iter().enumerate() {
                visit(service.as_str(), idx, address);
            }

            if addrs.len() > MAX_HOSTS_PER_SERVICE {
                tracing::error!(
                    "{} has {} addresses, only the first {} get aliases",
                    service,
                    addrs.len(),
                    MAX_HOSTS_PER_SERVICE
                );
            }
        }
    }

    /// Host to service labels.
    ///
    /// With `to_host_aliases`, labels become `service01`, `service02`, ...
    /// numbered by the order addresses were first seen for that service;
    /// addresses past the 99th are left out. With `include_ports`, the port
    /// specifier is appended to each label.
    pub fn all_available(&self, to_host_aliases: bool, include_ports: bool) -> HostTable {
        let mut table = HostTable::default();
        self.walk(|service, idx, address| {
            let mut label = if to_host_aliases {
                if idx >= MAX_HOSTS_PER_SERVICE {
                    return;
                }
                format!("{}{:02}", service, idx + 1)
            } else {
                service.to_string()
            };
            if include_ports {
                label.push_str(address.port());
            }
            table.add(address.host(), label);
        });
        table
    }

    /// Every aliased endpoint, grouped by service
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        self.walk(|service, idx, address| {
            if idx < MAX_HOSTS_PER_SERVICE {
                endpoints.push(Endpoint {
                    service: service.to_string(),
                    hostname: format!("{}{:02}", service, idx + 1),
                    address: address.clone(),
                });
            }
        });
        endpoints
    }

    /// Remove and return every claim whose deadline has passed, grouped by
    /// service. Does not fire change notifications; the caller announces
    /// the removals. Always empty without expiry tracking.
    pub fn expired(&self) -> BTreeMap<String, Vec<ServiceAddress>> {
        let now = Instant::now();
        let mut tables = lock(&self.tables);

        let mut removed: BTreeMap<String, Vec<ServiceAddress>> = BTreeMap::new();
        if let Some(expires) = tables.expires.as_mut() {
            for (service, by_address) in expires.iter_mut() {
                by_address.retain(|address, deadline| {
                    if *deadline <= now {
                        removed.entry(service.clone()).or_default().push(address.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            expires.retain(|_, by_address| !by_address.is_empty());
        }

        for (service, addrs) in &mut removed {
            addrs.sort();
            for address in addrs.iter() {
                tables.remove(service, address);
            }
        }
        removed
    }
}

impl MessageProcessor for AvailabilityProcessor {
    fn accepts(&self) -> Accepts {
        Accepts::Kind(MessageKind::Availability)
    }

    fn process(&self, envelope: &Envelope) -> Result<()> {
        match envelope.message() {
            Message::Availability(msg) => self.hooks.run(envelope, || Ok(self.apply(msg))),
            other => anyhow::bail!("availability processor cannot handle {:?} messages", other.kind()),
        }
    }
}

/// Coalesces bursts of changes into one callback per window.
///
/// The first change after a quiet period starts the window; changes inside
/// the window ride along. When the window closes the callback sees the
/// processor's state at that moment.
pub struct ChangeNotifier {
    processor: Arc<AvailabilityProcessor>,
    signal: Arc<ChangeSignal>,
    window: Duration,
}

impl ChangeNotifier {
    pub async fn run<F, Fut>(self, on_change: F, cancel: CancellationToken)
    where
        F: Fn(Arc<AvailabilityProcessor>) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            tokio::select! {
                _ = self.signal.notify.notified() => {}
                _ = cancel.cancelled() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.window) => {}
                _ = cancel.cancelled() => break,
            }

            // cleared first so changes made during the callback schedule a new window
            self.signal.pending.store(false, Ordering::SeqCst);
            on_change(self.processor.clone()).await;
        }

        tracing::debug!("Change notifier shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn announce(services: &[&str], address: &str) -> Envelope {
        Envelope::new(AvailabilityMessage::available(
            services.iter().map(|s| s.to_string()).collect(),
            address,
            10,
        ))
    }

    fn announce_ttl(services: &[&str], address: &str, ttl: u32) -> Envelope {
        Envelope::new(AvailabilityMessage::available(
            services.iter().map(|s| s.to_string()).collect(),
            address,
            ttl,
        ))
    }

    fn withdraw(services: &[&str], address: &str) -> Envelope {
        Envelope::new(AvailabilityMessage::unavailable(
            services.iter().map(|s| s.to_string()).collect(),
            address,
        ))
    }

    fn addr(host: &str) -> ServiceAddress {
        ServiceAddress::host_only(host)
    }

    #[test]
    fn test_empty_initially() {
        let p = AvailabilityProcessor::new(false);
        assert!(p.available("some_service").is_empty());
        assert!(p.all_available(false, false).is_empty());
    }

    #[test]
    fn test_available_addresses() {
        let p = AvailabilityProcessor::new(false);
        p.process(&announce(&["service1", "service2"], "1.2.3.4")).unwrap();
        p.process(&announce(&["service2", "service3"], "2.3.4.5")).unwrap();

        assert_eq!(p.available("service1"), vec![addr("1.2.3.4")]);
        assert_eq!(p.available("service2"), vec![addr("1.2.3.4"), addr("2.3.4.5")]);
        assert_eq!(p.available("service3"), vec![addr("2.3.4.5")]);
    }

    #[test]
    fn test_unavailable_addresses_removed() {
        let p = AvailabilityProcessor::new(false);
        p.process(&announce(&["service1", "service2"], "1.2.3.4")).unwrap();
        p.process(&withdraw(&["service2", "service3"], "1.2.3.4")).unwrap();

        assert_eq!(p.available("service1"), vec![addr("1.2.3.4")]);
        assert!(p.available("service2").is_empty());
        assert!(p.available("service3").is_empty());
    }

    #[test]
    fn test_ports_kept() {
        let p = AvailabilityProcessor::new(false);
        p.process(&announce(&["service1:101", "service2:102"], "1.2.3.4")).unwrap();
        p.process(&announce(&["service2:202", "service3:203"], "2.3.4.5")).unwrap();

        assert_eq!(p.available("service1"), vec![ServiceAddress::new("1.2.3.4", ":101")]);
        assert_eq!(
            p.available("service2"),
            vec![ServiceAddress::new("1.2.3.4", ":102"), ServiceAddress::new("2.3.4.5", "202")]
        );
        assert_eq!(p.available("service3"), vec![ServiceAddress::new("2.3.4.5", "203")]);
    }

    #[test]
    fn test_latest_claim_wins() {
        let p = AvailabilityProcessor::new(false);
        p.process(&announce(&["web"], "1.1.1.1")).unwrap();
        p.process(&announce(&["web"], "2.2.2.2")).unwrap();
        p.process(&withdraw(&["web"], "1.1.1.1")).unwrap();
        p.process(&announce(&["web"], "1.1.1.1")).unwrap();
        p.process(&withdraw(&["web"], "2.2.2.2")).unwrap();
        p.process(&withdraw(&["web"], "3.3.3.3")).unwrap();

        assert_eq!(p.available("web"), vec![addr("1.1.1.1")]);
    }

    #[test]
    fn test_all_available_maps_hosts_to_services() {
        let p = AvailabilityProcessor::new(false);
        p.process(&announce(&["service1"], "1.2.3.4")).unwrap();
        p.process(&announce(&["service2"], "1.2.3.4")).unwrap();
        p.process(&announce(&["service3"], "2.3.4.5")).unwrap();
        p.process(&announce(&["service1"], "2.3.4.5")).unwrap();

        let all = p.all_available(false, false);
        assert_eq!(all.get("1.2.3.4").unwrap(), ["service1", "service2"]);
        assert_eq!(all.get("2.3.4.5").unwrap(), ["service1", "service3"]);

        p.process(&withdraw(&["service1", "service2"], "1.2.3.4")).unwrap();
        let all = p.all_available(false, false);
        assert!(!all.contains_host("1.2.3.4"));
        assert!(all.contains_host("2.3.4.5"));
    }

    #[test]
    fn test_host_aliases_with_ports() {
        let p = AvailabilityProcessor::new(false);
        p.process(&announce(&["service:80"], "1.2.3.4")).unwrap();
        p.process(&announce(&["service:81"], "1.2.3.4")).unwrap();
        p.process(&announce(&["service:80"], "2.3.4.5")).unwrap();

        let all = p.all_available(true, true);
        assert_eq!(all.get("1.2.3.4").unwrap(), ["service01:80", "service02:81"]);
        assert_eq!(all.get("2.3.4.5").unwrap(), ["service03:80"]);

        let all = p.all_available(true, false);
        assert_eq!(all.get("1.2.3.4").unwrap(), ["service01", "service02"]);
        assert_eq!(all.get("2.3.4.5").unwrap(), ["service03"]);
    }

    #[test]
    fn test_host_aliases_stable() {
        let p = AvailabilityProcessor::new(false);
        p.process(&announce(&["service"], "1.2.3.4")).unwrap();
        assert_eq!(p.all_available(true, false).get("1.2.3.4").unwrap(), ["service01"]);

        p.process(&announce(&["service"], "2.3.4.5")).unwrap();
        p.process(&announce(&["service"], "3.4.5.6")).unwrap();
        // redundant
        p.process(&announce(&["service"], "3.4.5.6")).unwrap();

        let all = p.all_available(true, false);
        assert_eq!(all.get("1.2.3.4").unwrap(), ["service01"]);
        assert_eq!(all.get("2.3.4.5").unwrap(), ["service02"]);
        assert_eq!(all.get("3.4.5.6").unwrap(), ["service03"]);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_readded_host_gets_next_suffix() {
        let p = AvailabilityProcessor::new(false);
        for host in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            p.process(&announce(&["svc"], host)).unwrap();
        }
        p.process(&withdraw(&["svc"], "2.2.2.2")).unwrap();
        p.process(&announce(&["svc"], "2.2.2.2")).unwrap();

        let all = p.all_available(true, false);
        assert_eq!(all.get("1.1.1.1").unwrap(), ["svc01"]);
        assert_eq!(all.get("3.3.3.3").unwrap(), ["svc02"]);
        assert_eq!(all.get("2.2.2.2").unwrap(), ["svc03"]);
    }

    #[test]
    fn test_alias_limit() {
        let p = AvailabilityProcessor::new(false);
        for i in 0..=MAX_HOSTS_PER_SERVICE {
            p.process(&announce(&["big"], &format!("10.0.{}.{}", i / 256, i % 256))).unwrap();
        }

        assert_eq!(p.available("big").len(), MAX_HOSTS_PER_SERVICE + 1);
        let all = p.all_available(true, false);
        assert_eq!(all.len(), MAX_HOSTS_PER_SERVICE);
        assert_eq!(all.get("10.0.0.98").unwrap(), ["big99"]);
        assert!(!all.contains_host("10.0.0.99"));
        assert_eq!(p.endpoints().len(), MAX_HOSTS_PER_SERVICE);
    }

    #[test]
    fn test_endpoints() {
        let p = AvailabilityProcessor::new(false);
        p.process(&announce(&["web:80", "db"], "1.1.1.1")).unwrap();
        p.process(&announce(&["web:80"], "2.2.2.2")).unwrap();
        p.process(&announce(&["web:81"], "1.1.1.1")).unwrap();

        let endpoints = p.endpoints();
        assert_eq!(
            endpoints,
            vec![
                Endpoint {
                    service: "web".to_string(),
                    hostname: "web01".to_string(),
                    address: ServiceAddress::new("1.1.1.1", ":80"),
                },
                Endpoint {
                    service: "web".to_string(),
                    hostname: "web02".to_string(),
                    address: ServiceAddress::new("2.2.2.2", ":80"),
                },
                Endpoint {
                    service: "web".to_string(),
                    hostname: "web03".to_string(),
                    address: ServiceAddress::new("1.1.1.1", ":81"),
                },
                Endpoint {
                    service: "db".to_string(),
                    hostname: "db01".to_string(),
                    address: addr("1.1.1.1"),
                },
            ]
        );
    }

    #[test]
    fn test_changed_callback_fires_on_change() {
        let p = AvailabilityProcessor::new(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        p.set_availability_changed(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        p.process(&announce(&["service"], "1.2.3.4")).unwrap();
        p.process(&announce(&["service"], "2.3.4.5")).unwrap();
        p.process(&announce(&["service_b"], "1.2.3.4")).unwrap();
        p.process(&withdraw(&["service"], "1.2.3.4")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_changed_callback_silent_without_change() {
        let p = AvailabilityProcessor::new(false);
        p.process(&announce(&["service_a", "service_b"], "1.2.3.4")).unwrap();
        p.process(&announce(&["service_c"], "1.2.3.4")).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        p.set_availability_changed(move |p| {
            assert!(!p.services().is_empty());
            c.fetch_add(1, Ordering::SeqCst);
        });

        p.process(&announce(&["service_a"], "1.2.3.4")).unwrap();
        p.process(&announce(&["service_b", "service_c"], "1.2.3.4")).unwrap();
        p.process(&withdraw(&["service_z"], "1.2.3.4")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_post_hook_sees_transitions() {
        let p = AvailabilityProcessor::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        p.hooks().set_post_process(move |_, transitions| {
            s.lock().unwrap().push(transitions.clone());
            Ok(())
        });

        p.process(&announce(&["web:80", "db"], "1.1.1.1")).unwrap();
        p.process(&announce(&["web:80"], "1.1.1.1")).unwrap();
        p.process(&withdraw(&["db"], "1.1.1.1")).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].len(), 2);
        assert_eq!(seen[0][0].label(), "web:80");
        assert!(seen[1].is_empty());
        assert_eq!(
            seen[2],
            vec![Transition {
                service: "db".to_string(),
                address: addr("1.1.1.1"),
                available: false,
            }]
        );
    }

    #[test]
    fn test_rejects_other_kinds() {
        let p = AvailabilityProcessor::new(false);
        let sub = Envelope::new(shared::message::SubscriptionMessage::subscribe(vec![], "q"));
        assert!(p.process(&sub).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let p = AvailabilityProcessor::new(true);
        p.process(&announce_ttl(&["web"], "1.1.1.1", 5)).unwrap();
        p.process(&announce_ttl(&["web"], "2.2.2.2", 60)).unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(p.expired().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = p.expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired["web"], vec![addr("1.1.1.1")]);
        assert_eq!(p.available("web"), vec![addr("2.2.2.2")]);

        // reported exactly once
        assert!(p.expired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_expiry_silently() {
        let p = AvailabilityProcessor::new(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        p.set_availability_changed(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        p.process(&announce_ttl(&["web"], "1.1.1.1", 5)).unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        p.process(&announce_ttl(&["web"], "1.1.1.1", 5)).unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        assert!(p.expired().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(p.expired()["web"], vec![addr("1.1.1.1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdraw_clears_expiry() {
        let p = AvailabilityProcessor::new(true);
        p.process(&announce_ttl(&["web"], "1.1.1.1", 5)).unwrap();
        p.process(&withdraw(&["web"], "1.1.1.1")).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(p.expired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracked_never_expires() {
        let p = AvailabilityProcessor::new(false);
        assert!(!p.tracks_expiry());
        p.process(&announce_ttl(&["web"], "1.1.1.1", 1)).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(p.expired().is_empty());
        assert_eq!(p.available("web").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_claim() {
        let p = AvailabilityProcessor::new(true);
        p.process(&announce_ttl(&["web"], "1.1.1.1", u32::MAX)).unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(p.expired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_notifier_coalesces_bursts() {
        let p = Arc::new(AvailabilityProcessor::new(false));
        let notifier = p.change_notifier(Duration::from_secs(1));
        let fired = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let (f, s) = (fired.clone(), sizes.clone());
        let task = tokio::spawn(notifier.run(
            move |p| {
                f.fetch_add(1, Ordering::SeqCst);
                s.lock().unwrap().push(p.available("web").len());
                async {}
            },
            cancel.clone(),
        ));

        for i in 0..5 {
            p.process(&announce(&["web"], &format!("10.0.0.{}", i))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*sizes.lock().unwrap(), vec![5]);

        // duplicate announcements are not changes
        p.process(&announce(&["web"], "10.0.0.1")).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        p.process(&withdraw(&["web"], "10.0.0.1")).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(*sizes.lock().unwrap(), vec![5, 4]);

        cancel.cancel();
        task.await.unwrap();
    }
}
