//! End to end crawl runs over a scripted network and an in-memory store.

use bitcoin_census_connection::unix_timestamp;
use bitcoin_census_crawler::{
    AddressEntry, AttemptOutcome, Candidate, ConnectionError, Connector, CrawlSettings,
    CrawlerBuilder, FileSnapshotWriter, MemoryStore, Message, MessageKind, NodeAddress, NodeKey,
    PeerConnection, PeerInfo, SEED_SERVICES,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a scripted node answers.
#[derive(Debug, Clone)]
enum Behaviour {
    Refuse,
    Answer {
        height: i32,
        services: u64,
        /// Advertised peers with the age of their timestamp in seconds.
        peers: Vec<(&'static str, i64)>,
    },
}

/// A network of scripted nodes, keyed by address.
#[derive(Debug, Clone, Default)]
struct ScriptedNetwork {
    nodes: Arc<Mutex<HashMap<NodeAddress, Behaviour>>>,
    connects: Arc<Mutex<Vec<NodeKey>>>,
}

impl ScriptedNetwork {
    fn add(&self, address: &str, behaviour: Behaviour) {
        self.nodes
            .lock()
            .unwrap()
            .insert(address.parse().unwrap(), behaviour);
    }

    fn connects(&self) -> Vec<NodeKey> {
        self.connects.lock().unwrap().clone()
    }
}

struct ScriptedConnection {
    info: PeerInfo,
    incoming: VecDeque<Message>,
}

impl PeerConnection for ScriptedConnection {
    async fn handshake(&mut self) -> Result<PeerInfo, ConnectionError> {
        Ok(self.info.clone())
    }

    async fn get_addr(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn poll_messages(
        &mut self,
        kinds: &[MessageKind],
        max_wait: Duration,
    ) -> Result<Vec<Message>, ConnectionError> {
        match self.incoming.pop_front() {
            Some(message) if kinds.contains(&message.kind()) => Ok(vec![message]),
            Some(_) => Ok(Vec::new()),
            None => {
                tokio::time::sleep(max_wait).await;
                Ok(Vec::new())
            }
        }
    }

    async fn close(&mut self) {}
}

impl Connector for ScriptedNetwork {
    type Connection = ScriptedConnection;

    fn connect(
        &self,
        key: &NodeKey,
        _start_height: i32,
    ) -> impl std::future::Future<Output = Result<Self::Connection, ConnectionError>> + Send {
        self.connects.lock().unwrap().push(key.clone());
        let behaviour = self.nodes.lock().unwrap().get(&key.address).cloned();
        async move {
            match behaviour {
                Some(Behaviour::Answer {
                    height,
                    services,
                    peers,
                }) => {
                    let now = unix_timestamp();
                    let entries = peers
                        .into_iter()
                        .map(|(address, age)| AddressEntry {
                            timestamp: (now - age) as u32,
                            address: Some(address.parse().unwrap()),
                            port: 8333,
                            services: 1,
                        })
                        .collect();
                    Ok(ScriptedConnection {
                        info: PeerInfo {
                            services,
                            height,
                            user_agent: "/Satoshi:27.0.0/".to_string(),
                            version: 70016,
                        },
                        incoming: VecDeque::from([Message::Addr(entries)]),
                    })
                }
                Some(Behaviour::Refuse) | None => Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))),
            }
        }
    }
}

fn address(s: &str) -> NodeAddress {
    s.parse().unwrap()
}

fn seed_key(s: &str) -> NodeKey {
    NodeKey::new(address(s), 8333, SEED_SERVICES)
}

fn settings() -> CrawlSettings {
    CrawlSettings {
        max_age: Duration::from_secs(3600),
        ..CrawlSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_seed_pass_feeds_queue() {
    let network = ScriptedNetwork::default();
    network.add(
        "93.184.1.1",
        Behaviour::Answer {
            height: 800_000,
            services: 1,
            peers: vec![("93.184.2.1", 10), ("93.184.3.1", 999_999_999)],
        },
    );
    network.add(
        "93.184.1.2",
        Behaviour::Answer {
            height: 800_000,
            services: 1,
            peers: vec![("8.8.2.1", 10), ("8.8.3.1", 999_999_999)],
        },
    );
    network.add("93.184.1.3", Behaviour::Refuse);

    let crawler = CrawlerBuilder::new(settings())
        .build(Arc::new(MemoryStore::new()), network.clone())
        .unwrap();
    let seeded = crawler
        .seed(&[
            address("93.184.1.1"),
            address("93.184.1.2"),
            address("93.184.1.3"),
        ])
        .await
        .unwrap();
    assert_eq!(seeded, 3);

    // Take the seeds off the queue by key, since discovered peers land in the
    // same queue while the seeds are processed.
    let state = crawler.state();
    let worker = crawler.worker(0);
    let mut outcomes = Vec::new();
    for seed in ["93.184.1.1", "93.184.1.2", "93.184.1.3"] {
        let candidate = Candidate::new(seed_key(seed));
        assert!(state.remove_pending(&candidate).await.unwrap());
        outcomes.push(worker.process(candidate).await.unwrap());
    }
    assert_eq!(outcomes[2], AttemptOutcome::Unreachable);
    let reachable = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, AttemptOutcome::Reachable { .. }))
        .count();
    assert_eq!(reachable, 2);
    assert!(outcomes.contains(&AttemptOutcome::Unreachable));

    assert_eq!(state.up_count().await.unwrap(), 2);
    assert_eq!(state.all_nodes_count().await.unwrap(), 3);
    assert_eq!(state.all_nodes_bis_count().await.unwrap(), 2);

    let failed = seed_key("93.184.1.3");
    assert!(state.in_all_nodes(&failed).await.unwrap());
    assert!(!state.is_up(&failed).await.unwrap());

    let mut pending: Vec<String> = state
        .pending_members()
        .await
        .unwrap()
        .into_iter()
        .map(|candidate| candidate.key.to_string())
        .collect();
    pending.sort();
    assert_eq!(pending, vec!["8.8.2.1-8333-1", "93.184.2.1-8333-1"]);
    assert_eq!(
        state.height_of(&seed_key("93.184.1.1")).await.unwrap(),
        Some(800_000)
    );
}

#[tokio::test(start_paused = true)]
async fn test_attempted_candidate_is_not_retried() {
    let network = ScriptedNetwork::default();
    network.add("93.184.1.3", Behaviour::Refuse);

    let crawler = CrawlerBuilder::new(settings())
        .build(Arc::new(MemoryStore::new()), network.clone())
        .unwrap();
    crawler.seed(&[]).await.unwrap();

    let worker = crawler.worker(0);
    let candidate = Candidate::new(seed_key("93.184.1.3"));
    assert_eq!(
        worker.process(candidate.clone()).await.unwrap(),
        AttemptOutcome::Unreachable
    );
    assert_eq!(
        worker.process(candidate).await.unwrap(),
        AttemptOutcome::Duplicate
    );
    assert_eq!(network.connects().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_epoch_writes_snapshot_files() {
    let network = ScriptedNetwork::default();
    network.add(
        "93.184.1.1",
        Behaviour::Answer {
            height: 800_000,
            services: 1033,
            peers: vec![("93.184.2.1", 10), ("93.184.3.1", 999_999_999)],
        },
    );
    network.add(
        "93.184.2.1",
        Behaviour::Answer {
            height: 800_000,
            services: 1,
            peers: Vec::new(),
        },
    );

    let mut settings = settings();
    settings.seeders = vec!["93.184.1.1".to_string()];
    settings.workers = 2;
    let dir = tempfile::tempdir().unwrap();

    let crawler = CrawlerBuilder::new(settings)
        .build(Arc::new(MemoryStore::new()), network.clone())
        .unwrap();
    let sink = FileSnapshotWriter::new(dir.path()).unwrap();
    crawler
        .run_controller(sink, 2, tokio::time::sleep(Duration::from_secs(300)))
        .await
        .unwrap();

    let state = crawler.state();
    assert!(state.epoch().await.unwrap() >= 1);
    assert_eq!(state.consensus_height().await.unwrap(), 800_000);

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names
        .iter()
        .any(|name| name.ends_with(".json") && !name.starts_with("nodes_per_getADDR_")));
    assert!(names
        .iter()
        .any(|name| name.starts_with("nodes_per_getADDR_") && name.ends_with(".csv")));
    assert!(names
        .iter()
        .any(|name| name.starts_with("nodes_per_getADDR_") && name.ends_with(".json.zst")));
    assert!(names
        .iter()
        .any(|name| name.starts_with("up_nodes_per_seconds_") && name.ends_with(".csv")));

    // The seed is reseeded under the services it reported.
    let reported = NodeKey::new(address("93.184.1.1"), 8333, 1033);
    assert!(network.connects().contains(&reported));
}
