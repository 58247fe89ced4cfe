//! Full fresh-download scenario, start to finish.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use filemesh::store::FileStatus;
use filemesh::Controller;

/// Polls `get_file` until the record reaches `Ready` or the deadline passes.
async fn wait_until_ready(controller: &Controller, name: &str, deadline: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        if let Ok(metadata) = controller.get_file(name) {
            if metadata.status == FileStatus::Ready {
                return;
            }
        }
        if start.elapsed() > deadline {
            panic!("'{name}' did not become ready in time");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn a_searched_file_downloads_completely_from_its_provider() {
    let (dir_a, config_a) = common::test_config();
    let (_dir_b, config_b) = common::test_config();
    let tcp_a = config_a.tcp_port;

    let path = dir_a.path().join("payload.bin");
    std::fs::write(&path, vec![7u8; 4096]).unwrap();

    let controller_a = Controller::new(config_a).unwrap();
    let controller_b = Controller::new(config_b).unwrap();
    controller_a.start().await.unwrap();
    controller_b.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let added = controller_a.add_file(path).await.unwrap();

    let results = controller_b.search_file("payload.bin", None).await.unwrap();
    let matches = results.get(&added.digest).expect("provider should answer with the file's digest");
    let found = &matches[0];

    let peer = controller_b
        .known_peers_list()
        .into_iter()
        .find(|p| p.ip == found.provider_ip)
        .expect("provider should be a known peer");

    controller_b
        .schedule_download("payload.bin", Some(found.digest.clone()), found.size, SocketAddr::new(peer.ip, peer.tcp_port))
        .unwrap();

    wait_until_ready(&controller_b, "payload.bin", Duration::from_secs(5)).await;

    let downloaded = controller_b.get_file("payload.bin").unwrap();
    assert_eq!(downloaded.digest, added.digest);
    assert_eq!(downloaded.current_digest, added.digest);
    assert_eq!(downloaded.size, 4096);
    assert!(downloaded.can_share());
    let _ = tcp_a;

    controller_a.stop();
    controller_b.stop();
}
