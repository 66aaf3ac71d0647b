//! Tunnel selection and failover driven by scripted providers, so the state
//! machine can be exercised without any real tunnel binaries installed.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use command_relay::{
    selector::{EndpointStatus, TunnelSelector},
    tunnel::{LaunchedTunnel, TunnelError, TunnelProvider},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const LOCAL_URL: &str = "http://127.0.0.1:3055";

#[derive(Debug, Clone)]
enum Script {
    /// Binary not installed.
    Unavailable,
    /// Starts, prints nothing useful, never exits.
    Silent,
    /// Prints a URL on startup.
    Url(String),
}

#[derive(Debug)]
struct Counters {
    launches: AtomicUsize,
    probes: AtomicUsize,
    healthy: AtomicBool,
}

impl Counters {
    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

struct ScriptedTunnel {
    name: String,
    priority: u32,
    script: Script,
    counters: Arc<Counters>,
    // Keeps silent tunnels' output open so they run into the URL timeout
    // instead of looking exited.
    held: Mutex<Vec<mpsc::Sender<String>>>,
}

fn scripted(name: &str, priority: u32, script: Script) -> (ScriptedTunnel, Arc<Counters>) {
    let counters = Arc::new(Counters {
        launches: AtomicUsize::new(0),
        probes: AtomicUsize::new(0),
        healthy: AtomicBool::new(true),
    });
    let tunnel = ScriptedTunnel {
        name: name.to_string(),
        priority,
        script,
        counters: counters.clone(),
        held: Mutex::new(Vec::new()),
    };
    (tunnel, counters)
}

impl TunnelProvider for ScriptedTunnel {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn url_timeout(&self) -> Duration {
        Duration::from_millis(50)
    }

    fn is_available(&self) -> bool {
        !matches!(self.script, Script::Unavailable)
    }

    async fn launch(&self) -> Result<LaunchedTunnel, TunnelError> {
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(8);
        match &self.script {
            Script::Unavailable => return Err(TunnelError::Unavailable(self.name.clone())),
            Script::Silent => {
                let _ = tx.try_send("starting up...".to_string());
                self.held.lock().expect("held lock").push(tx);
            }
            Script::Url(url) => {
                let _ = tx.try_send("connecting".to_string());
                let _ = tx.try_send(format!("url: {url}"));
            }
        }
        Ok(LaunchedTunnel::from_output(rx))
    }

    fn extract_url(&self, output: &str) -> Option<String> {
        output.strip_prefix("url: ").map(ToOwned::to_owned)
    }

    async fn health_check(&self, url: &str) -> Result<(), TunnelError> {
        self.counters.probes.fetch_add(1, Ordering::SeqCst);
        if self.counters.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TunnelError::Probe(format!("{url} unreachable")))
        }
    }
}

fn bound_endpoint(status: &EndpointStatus) -> Option<(&str, &str)> {
    match status {
        EndpointStatus::Bound(binding) => Some((binding.endpoint.as_str(), binding.url.as_str())),
        _ => None,
    }
}

// ==================== scan ====================

#[tokio::test]
async fn third_candidate_binds_and_fourth_is_never_launched() {
    let (unavailable, unavailable_counts) = scripted("alpha", 0, Script::Unavailable);
    let (silent, silent_counts) = scripted("bravo", 1, Script::Silent);
    let (good, good_counts) = scripted("charlie", 2, Script::Url("https://charlie.example".into()));
    let (spare, spare_counts) = scripted("delta", 3, Script::Url("https://delta.example".into()));

    let mut selector = TunnelSelector::new(
        vec![unavailable, silent, good, spare],
        LOCAL_URL,
        Duration::from_secs(30),
    );
    let status = selector.scan().await;

    assert_eq!(bound_endpoint(&status), Some(("charlie", "https://charlie.example")));
    assert_eq!(selector.base_url().as_deref(), Some("https://charlie.example"));
    assert_eq!(unavailable_counts.launches(), 0);
    assert_eq!(silent_counts.launches(), 1);
    assert_eq!(good_counts.launches(), 1);
    assert_eq!(spare_counts.launches(), 0);
}

#[tokio::test]
async fn candidates_are_tried_by_priority_not_list_order() {
    let (low, low_counts) = scripted("low", 5, Script::Url("https://low.example".into()));
    let (high, _) = scripted("high", 1, Script::Url("https://high.example".into()));

    let mut selector = TunnelSelector::new(vec![low, high], LOCAL_URL, Duration::from_secs(30));
    let status = selector.scan().await;

    assert_eq!(bound_endpoint(&status), Some(("high", "https://high.example")));
    assert_eq!(low_counts.launches(), 0);
}

#[tokio::test]
async fn url_failing_health_probe_is_skipped() {
    let (sick, sick_counts) = scripted("sick", 0, Script::Url("https://sick.example".into()));
    let (fine, _) = scripted("fine", 1, Script::Url("https://fine.example".into()));
    sick_counts.set_healthy(false);

    let mut selector = TunnelSelector::new(vec![sick, fine], LOCAL_URL, Duration::from_secs(30));
    let status = selector.scan().await;

    assert_eq!(bound_endpoint(&status), Some(("fine", "https://fine.example")));
    assert_eq!(sick_counts.probes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn all_candidates_failing_degrades_to_local_url() {
    let (a, _) = scripted("a", 0, Script::Unavailable);
    let (b, _) = scripted("b", 1, Script::Silent);
    let (c, c_counts) = scripted("c", 2, Script::Url("https://c.example".into()));
    c_counts.set_healthy(false);

    let mut selector = TunnelSelector::new(vec![a, b, c], LOCAL_URL, Duration::from_secs(30));
    let status = selector.scan().await;

    assert_eq!(
        status,
        EndpointStatus::Degraded {
            local_url: LOCAL_URL.to_string()
        }
    );
    assert_eq!(selector.base_url().as_deref(), Some(LOCAL_URL));
}

// ==================== failover ====================

#[tokio::test]
async fn failed_reprobe_rescans_from_the_top() {
    let (primary, primary_counts) = scripted("primary", 0, Script::Url("https://primary.example".into()));
    let (backup, backup_counts) = scripted("backup", 1, Script::Url("https://backup.example".into()));

    let mut selector = TunnelSelector::new(vec![primary, backup], LOCAL_URL, Duration::from_secs(30));
    let mut observed = selector.subscribe();

    let status = selector.scan().await;
    assert_eq!(bound_endpoint(&status), Some(("primary", "https://primary.example")));

    // Healthy re-probe keeps the binding.
    let status = selector.check_binding().await;
    assert_eq!(bound_endpoint(&status), Some(("primary", "https://primary.example")));
    assert_eq!(primary_counts.launches(), 1);

    primary_counts.set_healthy(false);
    observed.borrow_and_update();
    let status = selector.check_binding().await;

    assert_eq!(bound_endpoint(&status), Some(("backup", "https://backup.example")));
    // The rescan started at the highest-priority candidate again.
    assert_eq!(primary_counts.launches(), 2);
    assert_eq!(backup_counts.launches(), 1);
    assert!(observed.has_changed().expect("selector alive"));
}

#[tokio::test]
async fn check_without_binding_is_a_noop() {
    let (only, only_counts) = scripted("only", 0, Script::Silent);
    let mut selector = TunnelSelector::new(vec![only], LOCAL_URL, Duration::from_secs(30));

    assert_eq!(selector.check_binding().await, EndpointStatus::Unbound);
    assert_eq!(only_counts.launches(), 0);
}

// ==================== run loop ====================

#[tokio::test]
async fn run_binds_then_unbinds_on_cancel() {
    let (tunnel, counts) = scripted("only", 0, Script::Url("https://only.example".into()));
    let selector = TunnelSelector::new(vec![tunnel], LOCAL_URL, Duration::from_millis(20));
    let mut status = selector.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(selector.run(cancel.clone()));

    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| matches!(s, EndpointStatus::Bound(_))),
    )
    .await
    .expect("selector should bind")
    .expect("selector alive");

    // Let a few health intervals pass.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(counts.probes.load(Ordering::SeqCst) >= 2);
    assert_eq!(counts.launches(), 1);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("selector should stop")
        .expect("selector should not panic");
    assert_eq!(*status.borrow(), EndpointStatus::Unbound);
}

#[tokio::test]
async fn degraded_run_idles_until_cancel() {
    let (tunnel, counts) = scripted("only", 0, Script::Unavailable);
    let selector = TunnelSelector::new(vec![tunnel], LOCAL_URL, Duration::from_millis(10));
    let mut status = selector.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(selector.run(cancel.clone()));

    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| matches!(s, EndpointStatus::Degraded { .. })),
    )
    .await
    .expect("selector should degrade")
    .expect("selector alive");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counts.launches(), 0);
    assert!(!task.is_finished());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("selector should stop")
        .expect("selector should not panic");
}
