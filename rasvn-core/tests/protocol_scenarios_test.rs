//! End-to-end protocol scenarios over in-process duplex streams: a real
//! client connection on one side, a real served edit or update on the
//! other.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use rasvn_core::{
    handle_commands, run_update, serve_edit, serve_update, BoxFuture, CmdEntry, Connection,
    DispatchOptions, EditDriver, EditOutcome, EditReceiver, Error, ErrorKind,
    InMemoryRepository, Item, NodeBranchId, NodeContent, NodeKind, PegPath, RepoOracle,
    Result, TxnOptions, TxnPath, TxnTree, WorkingCopy,
};

fn ping_cmd<'a>(
    conn: &'a mut Connection<DuplexStream>,
    _ctx: &'a mut (),
    _params: Vec<Item>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move { conn.write_cmd_response("", &[]).await })
}

/// Scenario: `( ping ( ) )` in, `( success ( ) )` out, byte for byte.
#[tokio::test]
async fn ping_bytes_on_the_wire() {
    let (mut raw_client, server) = duplex(256);
    let table = vec![CmdEntry { name: "ping", handler: ping_cmd, terminal: true }];
    let server_task = tokio::spawn(async move {
        let mut conn = Connection::new(server);
        handle_commands(&mut conn, &mut (), &table, DispatchOptions::default()).await
    });

    raw_client.write_all(b"( ping ( ) ) ").await.unwrap();
    let mut response = vec![0u8; 16];
    raw_client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response[..], b"( success ( ) ) ".as_slice());
    server_task.await.unwrap().unwrap();
}

/// Scenario: a string with embedded whitespace crosses the wire intact.
#[tokio::test]
async fn string_with_embedded_whitespace() {
    let (client, mut raw_server) = duplex(256);
    let mut conn = Connection::new(client);
    conn.write_string(b"hello world\n").await.unwrap();
    conn.flush().await.unwrap();
    drop(conn);

    let mut bytes = Vec::new();
    raw_server.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(&bytes[..], b"12:hello world\n ".as_slice());
}

/// Scenario: a two-link failure chain is reconstructed innermost-last.
#[tokio::test]
async fn failure_chain_across_the_wire() {
    let (client, server) = duplex(512);
    let mut tx = Connection::new(server);
    let mut rx = Connection::new(client);

    let inner = Error::new(ErrorKind::NotFound, "path not found");
    let outer = Error::with_cause(ErrorKind::OutOfDate, "no such revision", inner);
    tx.write_cmd_failure(&outer).await.unwrap();
    tx.flush().await.unwrap();

    let err = rx.read_cmd_response("").await.unwrap_err();
    let chain: Vec<&str> = err.chain().map(|e| e.message.as_str()).collect();
    assert_eq!(chain, vec!["no such revision", "path not found"]);
    assert_eq!(err.root_cause().kind, ErrorKind::NotFound);
}

async fn seeded_repo() -> Arc<InMemoryRepository> {
    let repo = Arc::new(InMemoryRepository::new());
    let mut txn = TxnTree::begin(repo.clone(), TxnOptions::default())
        .await
        .unwrap();
    let root = TxnPath::of(PegPath::committed(0, ""));
    txn.mk(NodeKind::Dir, root, "trunk".to_string()).await.unwrap();
    assert_eq!(txn.complete().await.unwrap(), 1);
    repo
}

/// Scenario: path-style create-and-populate, driven over the wire, commits
/// and reports the new revision.
#[tokio::test]
async fn path_style_commit_over_the_wire() {
    let repo = seeded_repo().await;
    let (client, server) = duplex(4096);

    let server_repo = repo.clone();
    let server_task = tokio::spawn(async move {
        let mut conn = Connection::new(server);
        let txn = TxnTree::begin(server_repo, TxnOptions::default())
            .await
            .unwrap();
        serve_edit(&mut conn, txn).await.unwrap().1
    });

    let mut conn = Connection::new(client);
    let mut driver = EditDriver::new(&mut conn);
    driver
        .mk(
            NodeKind::File,
            TxnPath::of(PegPath::committed(1, "trunk")),
            "a",
        )
        .await
        .unwrap();
    let content = NodeContent::file(BTreeMap::new(), Bytes::from_static(b"text\n"));
    driver
        .put(
            TxnPath::new(PegPath::committed(1, "trunk"), "a"),
            content.clone(),
        )
        .await
        .unwrap();
    let rev = driver.complete().await.unwrap();
    assert_eq!(rev, 2);
    assert_eq!(server_task.await.unwrap(), EditOutcome::Committed(2));

    let fetched = repo.fetch_content(2, "trunk/a").await.unwrap();
    assert_eq!(fetched.text, content.text);
    assert_eq!(fetched.checksum, content.checksum);
}

/// Scenario: a failed operation produces exactly one failure response and
/// the remaining pipelined drive is consumed quietly.
#[tokio::test]
async fn failed_edit_reports_once_and_drains() {
    let repo = seeded_repo().await;
    let (client, server) = duplex(4096);

    let server_task = tokio::spawn(async move {
        let mut conn = Connection::new(server);
        let txn = TxnTree::begin(repo, TxnOptions::default()).await.unwrap();
        serve_edit(&mut conn, txn).await.unwrap().1
    });

    let mut conn = Connection::new(client);
    let mut driver = EditDriver::new(&mut conn);
    // Duplicate name: the second mk violates the free-name precondition.
    driver
        .mk(NodeKind::Dir, TxnPath::of(PegPath::committed(1, "")), "x")
        .await
        .unwrap();
    driver
        .mk(NodeKind::Dir, TxnPath::of(PegPath::committed(1, "")), "x")
        .await
        .unwrap();
    // More pipelined traffic after the failure; it must be drained.
    driver
        .mk(NodeKind::Dir, TxnPath::of(PegPath::committed(1, "")), "y")
        .await
        .unwrap();
    let err = driver.complete().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Precondition);
    assert_eq!(server_task.await.unwrap(), EditOutcome::Failed);
}

/// Scenario: id-style move via `alter`; the stale second editor sees an
/// out-of-date failure at complete.
#[tokio::test]
async fn id_style_move_and_ood_conflict() {
    let repo = seeded_repo().await;

    // r2: put a file into trunk so there is something to move.
    let mut txn = TxnTree::begin(repo.clone(), TxnOptions::default())
        .await
        .unwrap();
    txn.mk(
        NodeKind::File,
        TxnPath::of(PegPath::committed(1, "trunk")),
        "a".to_string(),
    )
    .await
    .unwrap();
    assert_eq!(txn.complete().await.unwrap(), 2);

    let file = repo.resolve_peg(2, "trunk/a").await.unwrap();
    let root = repo.resolve_peg(2, "").await.unwrap();

    let drive = |name: &'static str| {
        let repo = repo.clone();
        let file = file.clone();
        let root = root.clone();
        async move {
            let (client, server) = duplex(4096);
            let server_task = tokio::spawn(async move {
                let mut conn = Connection::new(server);
                let txn = TxnTree::begin(repo, TxnOptions::default()).await.unwrap();
                serve_edit(&mut conn, txn).await.unwrap().1
            });
            let mut conn = Connection::new(client);
            let mut driver = EditDriver::new(&mut conn);
            driver
                .alter(
                    2,
                    file,
                    root,
                    name,
                    NodeContent::reference(PegPath::committed(2, "trunk/a")),
                )
                .await
                .unwrap();
            let result = driver.complete().await;
            (result, server_task.await.unwrap())
        }
    };

    // First editor moves trunk/a to the root; applies cleanly.
    let (result, outcome) = drive("moved").await;
    assert_eq!(result.unwrap(), 3);
    assert_eq!(outcome, EditOutcome::Committed(3));

    // Second editor still bases its alter on r2: out of date.
    let (result, outcome) = drive("elsewhere").await;
    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::OutOfDate);
    assert_eq!(outcome, EditOutcome::Failed);
}

/// Scenario: abort discards the transaction.
#[tokio::test]
async fn abort_discards_the_edit() {
    let repo = seeded_repo().await;
    let (client, server) = duplex(4096);

    let server_repo = repo.clone();
    let server_task = tokio::spawn(async move {
        let mut conn = Connection::new(server);
        let txn = TxnTree::begin(server_repo, TxnOptions::default())
            .await
            .unwrap();
        serve_edit(&mut conn, txn).await.unwrap().1
    });

    let mut conn = Connection::new(client);
    let mut driver = EditDriver::new(&mut conn);
    driver
        .mk(NodeKind::Dir, TxnPath::of(PegPath::committed(1, "")), "scrap")
        .await
        .unwrap();
    driver.abort().await.unwrap();
    assert_eq!(server_task.await.unwrap(), EditOutcome::Aborted);
    assert_eq!(repo.head_rev().await, 1);
}

/// The update drive: the server computes the difference and reshapes the
/// client's working copy inline.
#[tokio::test]
async fn update_drive_reshapes_working_copy() {
    let repo = seeded_repo().await;

    // Client checks out r1.
    let mut wc = WorkingCopy::checkout(1, repo.snapshot(1).await.unwrap());

    // r2 adds trunk/a with content.
    let mut txn = TxnTree::begin(repo.clone(), TxnOptions::default())
        .await
        .unwrap();
    txn.mk(
        NodeKind::File,
        TxnPath::of(PegPath::committed(1, "trunk")),
        "a".to_string(),
    )
    .await
    .unwrap();
    txn.put(
        TxnPath::new(PegPath::committed(1, "trunk"), "a"),
        NodeContent::file(BTreeMap::new(), Bytes::from_static(b"fresh")),
    )
    .await
    .unwrap();
    assert_eq!(txn.complete().await.unwrap(), 2);

    let (client, server) = duplex(4096);
    let server_repo = repo.clone();
    let server_task = tokio::spawn(async move {
        let mut conn = Connection::new(server);
        // The session side: read the update request, then drive.
        let (name, params) = conn.read_command().await.unwrap();
        assert_eq!(name, "update");
        let vals = rasvn_core::parse_tuple(&params, "ln").unwrap();
        let target = rasvn_core::opt_rev(vals[0].list()).unwrap();
        let base = vals[1].number();
        serve_update(&mut conn, server_repo.as_ref(), target, base)
            .await
            .unwrap()
    });

    let mut conn = Connection::new(client);
    let new_rev = run_update(&mut conn, &mut wc, None).await.unwrap();
    assert_eq!(new_rev, 2);
    assert_eq!(server_task.await.unwrap(), 2);

    assert_eq!(wc.base_revision(), 2);
    assert_eq!(
        wc.node_at_path("trunk/a").unwrap().content.text,
        Some(Bytes::from_static(b"fresh"))
    );
}

/// A refused update (bad base revision) surfaces the server's failure and
/// leaves nothing pending on the stream.
#[tokio::test]
async fn refused_update_surfaces_failure() {
    let repo = seeded_repo().await;
    let mut wc = WorkingCopy::checkout(7, rasvn_core::Snapshot::empty(NodeBranchId::new("root")));

    let (client, server) = duplex(4096);
    let server_task = tokio::spawn(async move {
        let mut conn = Connection::new(server);
        let (_name, params) = conn.read_command().await.unwrap();
        let vals = rasvn_core::parse_tuple(&params, "ln").unwrap();
        let target = rasvn_core::opt_rev(vals[0].list()).unwrap();
        let base = vals[1].number();
        // No revision 7 exists; the error is reported as a failure.
        let err = serve_update(&mut conn, repo.as_ref(), target, base)
            .await
            .unwrap_err();
        conn.write_cmd_failure(&err).await.unwrap();
        conn.flush().await.unwrap();
    });

    let mut conn = Connection::new(client);
    let err = run_update(&mut conn, &mut wc, None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    server_task.await.unwrap();
}
