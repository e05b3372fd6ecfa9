//! Record a session against a scripted server, then replay it offline and
//! check the replayed session is indistinguishable at the API boundary.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread;

use graphwire::{
    Address, ConnectorConfig, Datum, GraphConnector, GraphError, MockRecordConnector,
    MockReplayConnector, MockStore, TcpConnector, Varenv,
};

/// One-connection stub: serves the scripted frames in order on a single
/// accepted connection.
fn spawn_stub(replies: &'static [&'static str]) -> (Address, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = Address::new("127.0.0.1", listener.local_addr().unwrap().port());
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);
        for reply in replies {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap() == 0 {
                return;
            }
            writer.write_all(reply.as_bytes()).unwrap();
            writer.flush().unwrap();
        }
    });
    (addr, handle)
}

const SESSION_SCRIPT: &[&str] = &[
    "ok dateline=\"d,10\" cost=\"tu=3\" ()\n",
    "ok dateline=\"d,14\" cost=\"tu=5 mm=2\" ((\"/en/topic\" \"#0000aa\"))\n",
    "ok dateline=\"d,14\" cost=\"tu=1\" (\"again\")\n",
];

/// Run the canonical three-exchange session (one write, two reads, the
/// second read repeating the first query) against any connector.
fn run_session(conn: &mut dyn GraphConnector) -> (Varenv, Vec<Datum>) {
    let mut env = Varenv::new();
    let mut bodies = Vec::new();
    bodies.push(conn.write_varenv("(insert (\"x\"))", &mut env).unwrap().body);
    bodies.push(conn.read_varenv("(fetch (\"x\"))", &mut env).unwrap().body);
    bodies.push(conn.read_varenv("(fetch (\"x\"))", &mut env).unwrap().body);
    (env, bodies)
}

fn record_session() -> MockStore {
    let (addr, handle) = spawn_stub(SESSION_SCRIPT);
    let live = TcpConnector::new(ConnectorConfig::new(vec![addr])).unwrap();
    let mut recorder = MockRecordConnector::new(live);
    run_session(&mut recorder);
    handle.join().unwrap();
    recorder.into_store()
}

#[test]
fn replay_matches_recorded_session() {
    let store = record_session();
    assert_eq!(store.len(), 3);

    let mut replay = MockReplayConnector::new(store);
    let (env, bodies) = run_session(&mut replay);

    // Same bodies, same dateline evolution, without a server in sight.
    assert_eq!(
        bodies[1],
        Datum::List(vec![Datum::List(vec![
            Datum::Str("/en/topic".to_string()),
            Datum::Str("#0000aa".to_string()),
        ])])
    );
    assert_eq!(bodies[2], Datum::Str("again".to_string()));
    assert_eq!(env.write_dateline, "d,10");
    assert_eq!(env.dateline, "d,14");

    // Cost totals replay too.
    let cost = replay.get_cost();
    assert_eq!(cost.get("tu"), Some(&9.0));
    assert_eq!(cost.get("mm"), Some(&2.0));
    assert_eq!(cost.get("mql_dbreqs"), Some(&3.0));
}

#[test]
fn replay_survives_store_file_round_trip() {
    let store = record_session();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.mock");
    store.save(&path).unwrap();

    let mut replay = MockReplayConnector::from_file(&path).unwrap();
    let (env, bodies) = run_session(&mut replay);
    assert_eq!(bodies.len(), 3);
    assert_eq!(env.write_dateline, "d,10");
}

#[test]
fn replay_rejects_unrecorded_query() {
    let store = record_session();
    let mut replay = MockReplayConnector::new(store);
    let mut env = Varenv::new();

    let err = replay
        .read_varenv("(fetch (\"never-recorded\"))", &mut env)
        .unwrap_err();
    assert!(matches!(err, GraphError::Config(_)));
}

#[test]
fn recorded_server_error_replays_as_same_error() {
    const ERROR_SCRIPT: &[&str] = &[
        "ok dateline=\"d,3\" cost=\"tu=1\" (\"fine\")\n",
        "error cost=\"tu=2\" BADQUERY \"unknown primitive\"\n",
    ];
    let (addr, handle) = spawn_stub(ERROR_SCRIPT);
    let live = TcpConnector::new(ConnectorConfig::new(vec![addr])).unwrap();
    let mut recorder = MockRecordConnector::new(live);

    let mut env = Varenv::new();
    recorder.read_varenv("(fetch (\"ok\"))", &mut env).unwrap();
    let live_err = recorder.read_varenv("(bogus)", &mut env).unwrap_err();
    assert!(matches!(live_err, GraphError::Mql { .. }));
    handle.join().unwrap();

    // The error frame was captured alongside the successful one.
    let store = recorder.into_store();
    assert_eq!(store.len(), 2);

    let mut replay = MockReplayConnector::new(store);
    let mut env = Varenv::new();
    replay.read_varenv("(fetch (\"ok\"))", &mut env).unwrap();
    match replay.read_varenv("(bogus)", &mut env).unwrap_err() {
        GraphError::Mql { code, message } => {
            assert_eq!(code, "BADQUERY");
            assert_eq!(message, "unknown primitive");
        }
        other => panic!("expected query error, got {:?}", other),
    }
}

#[test]
fn repeated_queries_replay_in_recorded_order() {
    let store = record_session();
    let mut replay = MockReplayConnector::new(store);
    let mut env = Varenv::new();

    // Skip the write; ask for the repeated read twice. Occurrence order is
    // what distinguishes the two recorded replies.
    let first = replay.read_varenv("(fetch (\"x\"))", &mut env).unwrap();
    let second = replay.read_varenv("(fetch (\"x\"))", &mut env).unwrap();
    assert_ne!(first.body, second.body);
    assert_eq!(second.body, Datum::Str("again".to_string()));
}
