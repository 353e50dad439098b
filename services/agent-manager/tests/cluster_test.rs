// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Routing between management servers
//!
//! Peer traffic is captured in memory instead of going over sockets.

// Tests are allowed to panic and use unwrap/expect
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::SinkExt;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::FramedWrite;

use agent_manager::attache::{AttacheKind, ResourceFactory, ServerResource, Transport};
use agent_manager::catalog::MemoryCatalog;
use agent_manager::cluster::scan::scan_once;
use agent_manager::cluster::{
    ClusterDirectory, ClusterLock, ClusterRouter, LocalLock, PeerError, PeerInfo, PeerSender, SCAN_LOCK,
    StaticDirectory, run_membership_loop,
};
use agent_manager::listener::Listener;
use agent_manager::{AgentError, AgentManager, Attache, Collaborators, ManagerConfig, server};
use agent_protocol::frame::CURRENT_VERSION;
use agent_protocol::{
    AgentCodec, Answer, Command, Commands, Frame, RawFrame, Request, Response,
};
use host_types::{Host, HostEvent, HostId, HostStatus, HostType, MsId};

const LOCAL: MsId = 1;
const NODE_B: MsId = 2;
const NODE_C: MsId = 3;

#[derive(Default)]
struct Captured {
    sent: Mutex<Vec<(MsId, Bytes)>>,
}

impl Captured {
    fn frames(&self) -> Vec<(MsId, RawFrame)> {
        self.sent
            .lock()
            .iter()
            .map(|(to, bytes)| (*to, RawFrame::from_bytes(bytes.clone()).unwrap()))
            .collect()
    }

    async fn wait_for(&self, count: usize) {
        for _ in 0..100 {
            if self.sent.lock().len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {count} peer frames");
    }
}

#[async_trait]
impl PeerSender for Captured {
    async fn send_to_peer(&self, ms_id: MsId, bytes: Bytes) -> Result<(), PeerError> {
        self.sent.lock().push((ms_id, bytes));
        Ok(())
    }
}

#[derive(Default)]
struct Collect {
    answers: Mutex<Vec<Answer>>,
}

impl Listener for Collect {
    fn process_answers(&self, _host_id: HostId, _seq: u64, answers: &[Answer]) -> bool {
        self.answers.lock().extend_from_slice(answers);
        true
    }
}

/// Local host that answers every command in process.
struct Echo;

#[async_trait]
impl Transport for Echo {
    fn kind(&self) -> AttacheKind {
        AttacheKind::Connected
    }

    async fn deliver(&self, req: Request) -> Result<Option<Response>, AgentError> {
        let answers = req
            .commands
            .to_commands()
            .iter()
            .map(|c| Answer::success(c, json!({ "served_by": LOCAL })))
            .collect();
        Ok(Some(Response::for_request(&req, answers)))
    }

    fn close(&self) {}
}

/// Local host that records the order requests reach it in.
struct Recording(Arc<Mutex<Vec<u64>>>);

#[async_trait]
impl Transport for Recording {
    fn kind(&self) -> AttacheKind {
        AttacheKind::Connected
    }

    async fn deliver(&self, req: Request) -> Result<Option<Response>, AgentError> {
        let n = req.commands.to_commands()[0].payload["n"].as_u64().unwrap();
        self.0.lock().push(n);
        Ok(None)
    }

    fn close(&self) {}
}

/// In-process devices handed to the direct-agent scan.
#[derive(Default)]
struct Devices {
    created: AtomicUsize,
}

impl ResourceFactory for Devices {
    fn create(&self, host: &Host) -> Option<Arc<dyn ServerResource>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Some(Arc::new(Device(host.id)))
    }
}

struct Device(HostId);

#[async_trait]
impl ServerResource for Device {
    async fn initialize(&self) -> Vec<Command> {
        vec![Command::new(
            "StartupExternalDeviceCommand",
            json!({ "guid": format!("guid-{}", self.0) }),
        )]
    }

    async fn execute(&self, cmd: &Command) -> Answer {
        Answer::success(cmd, Value::Null)
    }

    async fn ping(&self) -> Option<Command> {
        Some(Command::ping(self.0))
    }
}

/// A device nobody has pinged for an hour.
fn silent_device(id: HostId) -> Host {
    let mut host = Host::new(id, format!("device-{id}"), format!("guid-{id}"));
    host.host_type = HostType::ExternalDevice;
    host.status = HostStatus::Disconnected;
    host.last_pinged = Utc::now() - chrono::Duration::hours(1);
    host
}

fn host_owned_by(id: HostId, owner: MsId) -> Host {
    let mut host = Host::new(id, format!("host-{id}"), format!("guid-{id}"));
    host.status = HostStatus::Up;
    host.ms_id = Some(owner);
    host
}

fn cluster(catalog: Arc<MemoryCatalog>) -> (Arc<AgentManager>, Arc<ClusterRouter>, Arc<Captured>) {
    let peers = Arc::new(Captured::default());
    let directory = StaticDirectory::new([PeerInfo {
        ms_id: NODE_B,
        name: "node-B".to_string(),
        addr: "127.0.0.1:1".to_string(),
    }]);
    let router = Arc::new(ClusterRouter::new(
        LOCAL,
        Arc::new(directory),
        Arc::new(LocalLock::new()),
        peers.clone(),
    ));

    let config = ManagerConfig {
        ms_id: LOCAL,
        ..Default::default()
    };
    let (_tx, rx) = watch::channel(config);
    let mgr = AgentManager::new(rx, Collaborators::new(catalog), Some(router.clone()));
    (mgr, router, peers)
}

fn scanning_cluster(
    catalog: Arc<MemoryCatalog>,
    lock: Arc<LocalLock>,
    devices: Arc<Devices>,
) -> (Arc<AgentManager>, Arc<ClusterRouter>) {
    let router = Arc::new(ClusterRouter::new(
        LOCAL,
        Arc::new(StaticDirectory::default()),
        lock,
        Arc::new(Captured::default()),
    ));
    let config = ManagerConfig {
        ms_id: LOCAL,
        ..Default::default()
    };
    let (_tx, rx) = watch::channel(config);
    let collaborators = Collaborators::new(catalog).with_resources(devices);
    let mgr = AgentManager::new(rx, collaborators, Some(router.clone()));
    (mgr, router)
}

fn raw_of(frame: Frame) -> RawFrame {
    RawFrame::from_bytes(frame.to_bytes().unwrap()).unwrap()
}

fn request_in(raw: &RawFrame) -> Request {
    match raw.decode().unwrap() {
        Frame::Request(req) => req,
        Frame::Response(_) => panic!("expected a request"),
    }
}

// ---- Test 1 ----
#[tokio::test]
async fn remote_host_gets_a_forwarding_attache() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(host_owned_by(5, NODE_B));
    let (mgr, _router, peers) = cluster(catalog);

    let listener = Arc::new(Collect::default());
    let seq = mgr
        .send_async(
            5,
            Commands::single(Command::new("StopVmCommand", Value::Null)),
            listener,
        )
        .await
        .unwrap();

    let attache = mgr.find_attache(5).unwrap();
    assert_eq!(attache.kind(), AttacheKind::Forwarding);
    assert_eq!(attache.forwarded_to(), Some(NODE_B));

    let frames = peers.frames();
    assert_eq!(frames.len(), 1);
    let (to, raw) = &frames[0];
    assert_eq!(*to, NODE_B);
    assert!(raw.header.from_server());
    assert_eq!(raw.header.via, LOCAL);
    assert_eq!(raw.seq(), seq);
}

// ---- Test 2 ----
#[tokio::test]
async fn cancelling_a_forwarded_call_tells_the_owner() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(host_owned_by(5, NODE_B));
    let (mgr, _router, peers) = cluster(catalog);

    let seq = mgr
        .send_async(
            5,
            Commands::single(Command::new("MigrateCommand", Value::Null)),
            Arc::new(Collect::default()),
        )
        .await
        .unwrap();
    let attache = mgr.find_attache(5).unwrap();
    assert_eq!(attache.outstanding(), 1);

    assert!(attache.cancel(seq).await);
    assert_eq!(attache.outstanding(), 0);

    let frames = peers.frames();
    assert_eq!(frames.len(), 2);
    let (to, raw) = &frames[1];
    assert_eq!(*to, NODE_B);
    assert!(raw.header.is_control());
    let ctl = request_in(raw);
    assert_eq!(ctl.commands.to_commands()[0].cancelled_seq(), Some(seq));
}

// ---- Test 3 ----
#[tokio::test]
async fn relayed_answers_reach_the_original_caller() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(host_owned_by(5, NODE_B));
    let (mgr, router, peers) = cluster(catalog);

    let listener = Arc::new(Collect::default());
    mgr.send_async(
        5,
        Commands::single(Command::new("GetVncPortCommand", Value::Null)),
        listener.clone(),
    )
    .await
    .unwrap();

    let forwarded = request_in(&peers.frames()[0].1);
    let cmd = &forwarded.commands.to_commands()[0];
    let reply = Response::for_request(&forwarded, vec![Answer::success(cmd, json!(5901))])
        .relayed_by(NODE_B);
    let raw = RawFrame::from_bytes(Frame::Response(reply).to_bytes().unwrap()).unwrap();

    router.handle_peer_frame(&mgr, raw).await;

    let answers = listener.answers.lock();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].payload, json!(5901));
    assert_eq!(mgr.find_attache(5).unwrap().outstanding(), 0);
}

// ---- Test 4 ----
#[tokio::test]
async fn peer_requests_for_local_hosts_are_answered_under_their_sequence() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(host_owned_by(6, LOCAL));
    let (mgr, router, peers) = cluster(catalog);
    mgr.add_attache(Attache::new(6, "host-6", LOCAL, CURRENT_VERSION, Box::new(Echo)));

    let req = Request::new(
        77,
        NODE_B,
        6,
        Commands::single(Command::new("StartVmCommand", Value::Null)),
    )
    .relayed_by(NODE_B);
    let raw = RawFrame::from_bytes(Frame::Request(req).to_bytes().unwrap()).unwrap();

    router.handle_peer_frame(&mgr, raw).await;
    peers.wait_for(1).await;

    let (to, raw) = &peers.frames()[0];
    assert_eq!(*to, NODE_B);
    let Frame::Response(resp) = raw.decode().unwrap() else {
        panic!("expected a response");
    };
    assert_eq!(resp.seq, 77);
    assert!(resp.is_successful());
    assert_eq!(resp.answers[0].payload, json!({ "served_by": LOCAL }));
    assert_eq!(router.relayed_calls(), 0);
}

// ---- Test 5 ----
#[tokio::test]
async fn requests_for_unknown_hosts_fail_back_to_the_sender() {
    let (mgr, router, peers) = cluster(Arc::new(MemoryCatalog::new()));

    let req = Request::new(
        12,
        NODE_B,
        404,
        Commands::single(Command::new("StartVmCommand", Value::Null)),
    )
    .relayed_by(NODE_B);
    let raw = RawFrame::from_bytes(Frame::Request(req).to_bytes().unwrap()).unwrap();
    router.handle_peer_frame(&mgr, raw).await;

    let (to, raw) = &peers.frames()[0];
    assert_eq!(*to, NODE_B);
    let Frame::Response(resp) = raw.decode().unwrap() else {
        panic!("expected a response");
    };
    assert_eq!(resp.seq, 12);
    assert!(!resp.answers[0].result);
}

// ---- Test 6 ----
#[tokio::test]
async fn remote_disconnect_drops_the_forwarding_attache() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(host_owned_by(5, NODE_B));
    let (mgr, router, _peers) = cluster(catalog);
    let attache = mgr.get_attache(5).await.unwrap();
    assert!(attache.is_forwarding());

    let notice = Request::control(
        0,
        NODE_B,
        5,
        Command::change_agent(5, HostEvent::AgentDisconnected),
    )
    .relayed_by(NODE_B);
    let raw = RawFrame::from_bytes(Frame::Request(notice).to_bytes().unwrap()).unwrap();
    router.handle_peer_frame(&mgr, raw).await;

    assert!(mgr.find_attache(5).is_none());
    assert!(attache.is_closed());
}

// ---- Test 7 ----
#[tokio::test]
async fn departed_node_releases_its_hosts() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(host_owned_by(5, NODE_B));
    catalog.insert(host_owned_by(6, LOCAL));
    let (mgr, router, _peers) = cluster(catalog.clone());
    mgr.get_attache(5).await.unwrap();
    mgr.add_attache(Attache::new(6, "host-6", LOCAL, CURRENT_VERSION, Box::new(Echo)));

    router.on_node_left(&mgr, NODE_B).await;

    assert!(mgr.find_attache(5).is_none());
    assert!(mgr.find_attache(6).is_some());
    let released = catalog.get(5).unwrap();
    assert_eq!(released.status, HostStatus::Disconnected);
    assert_eq!(released.ms_id, None);
    assert_eq!(catalog.get(6).unwrap().ms_id, Some(LOCAL));

    // With no owner left there is nothing to forward to.
    assert!(mgr.get_attache(5).await.unwrap_err().is_unavailable());
}

// ---- Test 8 ----
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relayed_requests_reach_the_local_host_in_order() {
    const COUNT: u64 = 500;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(host_owned_by(6, LOCAL));
    let (mgr, _router, _peers) = cluster(catalog);
    let seen = Arc::new(Mutex::new(Vec::new()));
    mgr.add_attache(Attache::new(
        6,
        "host-6",
        LOCAL,
        CURRENT_VERSION,
        Box::new(Recording(seen.clone())),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(server::serve(mgr.clone(), listener, stop_rx));

    // One socket from node B carrying requests in order.
    let sock = TcpStream::connect(addr).await.unwrap();
    let mut peer = FramedWrite::new(sock, AgentCodec::new());
    for n in 0..COUNT {
        let cmd = Command::new("StartVmCommand", json!({ "n": n }));
        let req = Request::new(n + 1, NODE_B, 6, Commands::single(cmd)).relayed_by(NODE_B);
        peer.send(Frame::Request(req)).await.unwrap();
    }

    for _ in 0..500 {
        if seen.lock().len() as u64 >= COUNT {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let seen = seen.lock().clone();
    assert_eq!(seen, (0..COUNT).collect::<Vec<_>>());
    stop.send_replace(true);
}

// ---- Test 9 ----
#[tokio::test]
async fn cancels_follow_calls_passed_on_to_the_owner() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(host_owned_by(7, NODE_C));
    let (mgr, router, peers) = cluster(catalog);

    // Node B still thinks this server holds host 7; the call moves on to C.
    let req = Request::new(
        31,
        NODE_B,
        7,
        Commands::single(Command::new("MigrateCommand", Value::Null)),
    )
    .relayed_by(NODE_B);
    router.handle_peer_frame(&mgr, raw_of(Frame::Request(req))).await;

    let cancel = Request::control(31, NODE_B, 7, Command::cancel(31, "caller gave up"))
        .relayed_by(NODE_B);
    router.handle_peer_frame(&mgr, raw_of(Frame::Request(cancel))).await;

    let frames = peers.frames();
    assert_eq!(frames.len(), 2);
    let (to, passed) = &frames[0];
    assert_eq!(*to, NODE_C);
    assert_eq!(passed.seq(), 31);

    let (to, ctl) = &frames[1];
    assert_eq!(*to, NODE_C);
    assert!(ctl.header.is_control());
    assert_eq!(ctl.header.via, LOCAL);
    let ctl = request_in(ctl);
    assert_eq!(ctl.ms_id, NODE_B);
    assert_eq!(ctl.commands.to_commands()[0].cancelled_seq(), Some(31));

    // A cancel that already went through another server stops here.
    let second_hop = Request::control(31, NODE_B, 7, Command::cancel(31, "caller gave up"))
        .relayed_by(NODE_C);
    router
        .handle_peer_frame(&mgr, raw_of(Frame::Request(second_hop)))
        .await;
    assert_eq!(peers.frames().len(), 2);
}

// ---- Test 10 ----
#[tokio::test(start_paused = true)]
async fn scan_skips_the_cycle_while_another_server_holds_the_lock() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(silent_device(8));
    let lock = Arc::new(LocalLock::new());
    let devices = Arc::new(Devices::default());
    let (mgr, router) = scanning_cluster(catalog.clone(), lock.clone(), devices.clone());

    let _held = lock
        .try_lock(SCAN_LOCK, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(scan_once(&mgr, &router).await, 0);
    assert_eq!(devices.created.load(Ordering::SeqCst), 0);
    assert!(mgr.find_attache(8).is_none());
    assert_eq!(catalog.get(8).unwrap().ms_id, None);
}

// ---- Test 11 ----
#[tokio::test]
async fn scan_loads_silent_devices_locally() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(silent_device(8));
    let devices = Arc::new(Devices::default());
    let (mgr, router) = scanning_cluster(
        catalog.clone(),
        Arc::new(LocalLock::new()),
        devices.clone(),
    );

    assert_eq!(scan_once(&mgr, &router).await, 1);

    let attache = mgr.find_attache(8).unwrap();
    assert_eq!(attache.kind(), AttacheKind::Direct);
    let host = catalog.get(8).unwrap();
    assert_eq!(host.status, HostStatus::Up);
    assert_eq!(host.ms_id, Some(LOCAL));
}

// ---- Test 12 ----
#[tokio::test]
async fn scan_does_not_load_a_device_twice() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(silent_device(8));
    let devices = Arc::new(Devices::default());
    let (mgr, router) = scanning_cluster(
        catalog.clone(),
        Arc::new(LocalLock::new()),
        devices.clone(),
    );

    assert_eq!(scan_once(&mgr, &router).await, 1);
    let first = mgr.find_attache(8).unwrap();

    // Still silent by the catalog, but already held here.
    assert_eq!(scan_once(&mgr, &router).await, 0);
    assert_eq!(devices.created.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&mgr.find_attache(8).unwrap(), &first));
    assert!(!first.is_closed());
}

// ---- Test 13 ----
#[tokio::test]
async fn reloaded_peer_list_releases_hosts_of_dropped_servers() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert(host_owned_by(5, NODE_B));
    let node = |ms_id: MsId| PeerInfo {
        ms_id,
        name: format!("node-{ms_id}"),
        addr: format!("127.0.0.1:{ms_id}"),
    };

    let directory = Arc::new(StaticDirectory::new([node(NODE_B)]));
    let router = Arc::new(ClusterRouter::new(
        LOCAL,
        directory.clone(),
        Arc::new(LocalLock::new()),
        Arc::new(Captured::default()),
    ));
    let config = ManagerConfig {
        ms_id: LOCAL,
        cluster_peers: vec![node(NODE_B)],
        ..Default::default()
    };
    let (config_tx, config_rx) = watch::channel(config);
    let mgr = AgentManager::new(
        config_rx.clone(),
        Collaborators::new(catalog.clone()),
        Some(router.clone()),
    );
    mgr.get_attache(5).await.unwrap();

    let (stop, stop_rx) = watch::channel(false);
    let membership = tokio::spawn(run_membership_loop(
        mgr.clone(),
        router.clone(),
        directory.clone(),
        config_rx,
        stop_rx,
    ));

    config_tx.send_modify(|c| c.cluster_peers = vec![node(LOCAL), node(NODE_C)]);
    for _ in 0..100 {
        if catalog.get(5).unwrap().ms_id.is_none() {
            break;
        }
        tokio::task::yield_now().await;
    }

    assert!(mgr.find_attache(5).is_none());
    assert_eq!(catalog.get(5).unwrap().ms_id, None);
    let ids: Vec<MsId> = directory.peers().iter().map(|p| p.ms_id).collect();
    assert_eq!(ids, vec![NODE_C]);

    stop.send_replace(true);
    membership.await.unwrap();
}
