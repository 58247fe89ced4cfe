//! End-to-end discovery and search scenarios.

mod common;

use std::time::Duration;

use filemesh::Controller;

#[tokio::test]
async fn two_nodes_discover_each_other() {
    let (_dir_a, config_a) = common::test_config();
    let (_dir_b, config_b) = common::test_config();
    let tcp_a = config_a.tcp_port;
    let tcp_b = config_b.tcp_port;

    let controller_a = Controller::new(config_a).unwrap();
    let controller_b = Controller::new(config_b).unwrap();
    controller_a.start().await.unwrap();
    controller_b.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let peers_a = controller_a.known_peers_list();
    let peers_b = controller_b.known_peers_list();
    assert_eq!(peers_a.len(), 1);
    assert_eq!(peers_b.len(), 1);
    assert_eq!(peers_a[0].tcp_port, tcp_b);
    assert_eq!(peers_b[0].tcp_port, tcp_a);

    controller_a.stop();
    controller_b.stop();
}

#[tokio::test]
async fn search_with_no_matching_file_returns_empty() {
    let (_dir_a, config_a) = common::test_config();
    let (_dir_b, config_b) = common::test_config();

    let controller_a = Controller::new(config_a).unwrap();
    let controller_b = Controller::new(config_b).unwrap();
    controller_a.start().await.unwrap();
    controller_b.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let results = controller_b.search_file("absent.bin", None).await.unwrap();
    assert!(results.is_empty());

    controller_a.stop();
    controller_b.stop();
}

#[tokio::test]
async fn search_finds_a_file_shared_by_a_peer() {
    let (dir_a, config_a) = common::test_config();
    let (_dir_b, config_b) = common::test_config();

    let path = dir_a.path().join("hello.txt");
    std::fs::write(&path, b"hello").unwrap();

    let controller_a = Controller::new(config_a).unwrap();
    let controller_b = Controller::new(config_b).unwrap();
    controller_a.start().await.unwrap();
    controller_b.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let added = controller_a.add_file(path).await.unwrap();

    let results = controller_b.search_file("hello.txt", None).await.unwrap();
    assert_eq!(results.len(), 1);
    let matches = results.get(&added.digest).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].name, "hello.txt");
    assert_eq!(matches[0].size, 5);

    controller_a.stop();
    controller_b.stop();
}

#[tokio::test]
async fn a_second_search_for_the_same_name_is_rejected_while_one_is_in_flight() {
    let (_dir_a, config_a) = common::test_config();
    let controller_a = Controller::new(config_a).unwrap();
    controller_a.start().await.unwrap();

    let first = controller_a.search_file("x.bin", None);
    tokio::pin!(first);
    // poll once to register the session before issuing the second search
    tokio::select! {
        _ = &mut first => {}
        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
    }
    let second = controller_a.search_file("x.bin", None).await;
    assert!(matches!(second, Err(filemesh::Error::SearchBusy(_))));

    first.await.unwrap();
    controller_a.stop();
}
