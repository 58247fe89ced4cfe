//! Resuming a partial download picks up where a prior attempt left off.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use filemesh::store::Store;
use filemesh::transfer::client;
use filemesh::Controller;

#[tokio::test]
async fn a_partially_downloaded_file_resumes_from_its_current_size() {
    let (dir_a, config_a) = common::test_config();
    let (dir_b, config_b) = common::test_config();
    let tcp_a = config_a.tcp_port;

    let full = vec![9u8; 10 * 1024];
    let source = dir_a.path().join("movie.bin");
    std::fs::write(&source, &full).unwrap();

    let controller_a = Controller::new(config_a).unwrap();
    controller_a.start().await.unwrap();
    let added = controller_a.add_file(source).await.unwrap();

    // Seed a partially-downloaded record for controller_b *before*
    // constructing it, exactly as a node resuming after a crash would find
    // it: a DOWNLOADING record whose current_size is less than size.
    let dest = config_b.data_dir.join("movie.bin");
    let half = &full[..full.len() / 2];
    std::fs::write(&dest, half).unwrap();
    {
        let seed_store = Store::open(&config_b.data_dir).unwrap();
        seed_store.init_meta("movie.bin", &dest, added.size, &added.digest).unwrap();
        seed_store.update_stat("movie.bin", half.len() as u64).unwrap();
    }

    let controller_b = Controller::new(config_b).unwrap();
    let seeded = controller_b.get_file("movie.bin").unwrap();
    assert_eq!(seeded.current_size, half.len() as u64);

    let endpoint = SocketAddr::new(std::net::IpAddr::from([127, 0, 0, 1]), tcp_a);
    client::download(controller_b.clone(), "movie.bin".to_string(), endpoint)
        .await
        .expect("resumed download should complete");

    let finished = controller_b.get_file("movie.bin").unwrap();
    assert!(finished.can_share());
    assert_eq!(finished.current_digest, added.digest);

    let on_disk = std::fs::read(&dest).unwrap();
    assert_eq!(on_disk, full);

    let _ = tokio::time::sleep(Duration::from_millis(0)).await;
    let _ = dir_b.path();
    controller_a.stop();
}
