//! Interactive line shell. One command per line, read from stdin.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::controller::Controller;
use crate::store::FileStatus;

const PROMPT: &str = "> ";

pub async fn run(controller: Arc<Controller>) {
    println!("filemesh shell. Type 'help' to list commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print!("{PROMPT}");
    flush();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
            if handle(&controller, cmd, rest.trim()).await {
                break;
            }
        }
        print!("{PROMPT}");
        flush();
    }
}

fn flush() {
    use std::io::Write;
    let _ = std::io::stdout().flush();
}

/// Returns `true` when the shell should exit.
async fn handle(controller: &Arc<Controller>, cmd: &str, arg: &str) -> bool {
    match cmd {
        "help" => print_help(),
        "peers" => cmd_peers(controller),
        "status" => cmd_status(controller),
        "search" => cmd_search(controller, arg).await,
        "download" => cmd_download(controller, arg).await,
        "add" => cmd_add(controller, arg).await,
        "remove" => cmd_remove(controller, arg),
        "info" => cmd_info(controller, arg),
        "start" => cmd_start(controller).await,
        "stop" => cmd_stop(controller),
        "exit" | "quit" => {
            controller.stop();
            println!("Bye");
            return true;
        }
        other => println!("unknown command '{other}', type 'help' to list commands"),
    }
    false
}

fn print_help() {
    println!("peers                 show known peers");
    println!("status                show local file states");
    println!("search <name>         search the network for a file");
    println!("download <name>       search then schedule a download");
    println!("add <path>            share a local file");
    println!("remove <name>         stop sharing a local file");
    println!("info <name>           show one file's details");
    println!("start | stop          start or stop the daemon");
    println!("exit                  stop the daemon and quit");
}

fn cmd_peers(controller: &Arc<Controller>) {
    let peers = controller.known_peers_list();
    if peers.is_empty() {
        println!("no known peers");
        return;
    }
    for (i, peer) in peers.iter().enumerate() {
        println!("{i}  {}  last seen {}", peer.ip, peer.last_seen);
    }
}

fn cmd_status(controller: &Arc<Controller>) {
    println!("repository: {:?}", controller.data_dir());
    let state = controller.state();
    if state.is_empty() {
        println!("no local files");
        return;
    }
    for (name, view) in state {
        let meta = &view.metadata;
        let detail = match meta.status {
            FileStatus::Downloading => {
                let progress = if meta.size == 0 { 0.0 } else { meta.current_size as f64 / meta.size as f64 * 100.0 };
                format!("{progress:.2}% from {:?}", view.downloading_from)
            }
            _ if view.consumer_count > 0 => format!("serving {} peers", view.consumer_count),
            _ => "-".to_string(),
        };
        println!("{name}  {}  {}  {}  {detail}", meta.fingerprint(), meta.size, meta.status);
    }
}

async fn cmd_search(controller: &Arc<Controller>, name: &str) {
    if name.is_empty() {
        println!("usage: search <name>");
        return;
    }
    println!("searching...");
    match controller.search_file(name, None).await {
        Ok(results) if results.is_empty() => println!("no files found in the network"),
        Ok(results) => {
            for (digest, providers) in &results {
                println!("{name}  {}  {} peers", crate::util::short_prefix(digest, 10), providers.len());
            }
        }
        Err(e) => println!("search failed: {e}"),
    }
}

async fn cmd_download(controller: &Arc<Controller>, name: &str) {
    if name.is_empty() {
        println!("usage: download <name>");
        return;
    }
    if controller.get_file(name).is_ok() {
        println!("file already exists in your local repository");
        return;
    }
    let results = match controller.search_file(name, None).await {
        Ok(r) => r,
        Err(e) => {
            println!("search failed: {e}");
            return;
        }
    };
    if results.is_empty() {
        println!("no files were found in the network");
        return;
    }
    let (_, candidates) = results.iter().next().unwrap();
    let Some(found) = candidates.choose(&mut rand::thread_rng()) else { return };
    let Some(peer) = controller.known_peers_list().into_iter().find(|p| p.ip == found.provider_ip) else {
        println!("chosen provider is no longer a known peer");
        return;
    };
    println!("starting download of '{}' from {}", found.name, peer.ip);
    let digest = if found.digest.is_empty() { None } else { Some(found.digest.clone()) };
    if let Err(e) = controller.schedule_download(&found.name, digest, found.size, SocketAddr::new(peer.ip, peer.tcp_port)) {
        println!("could not start download: {e}");
    }
}

async fn cmd_add(controller: &Arc<Controller>, path: &str) {
    if path.is_empty() {
        println!("usage: add <path>");
        return;
    }
    match controller.add_file(PathBuf::from(path)).await {
        Ok(meta) => println!("added '{}' with digest {}", meta.name, meta.digest),
        Err(e) => println!("error adding file: {e}"),
    }
}

fn cmd_remove(controller: &Arc<Controller>, name: &str) {
    if name.is_empty() {
        println!("usage: remove <name>");
        return;
    }
    match controller.remove_file(name) {
        Ok(()) => println!("removed '{name}' from the repository"),
        Err(e) => println!("cannot remove: {e}"),
    }
}

fn cmd_info(controller: &Arc<Controller>, name: &str) {
    if name.is_empty() {
        println!("usage: info <name>");
        return;
    }
    match controller.get_file(name) {
        Ok(meta) => println!(
            "{}  fingerprint {}  status {}  size {}  path {:?}",
            meta.name,
            meta.fingerprint(),
            meta.status,
            meta.size,
            meta.path
        ),
        Err(e) => println!("not found: {e}"),
    }
}

async fn cmd_start(controller: &Arc<Controller>) {
    if controller.is_running() {
        println!("daemon is already running");
    } else {
        println!("starting daemon...");
        if let Err(e) = controller.start().await {
            println!("failed to start: {e}");
        }
    }
}

fn cmd_stop(controller: &Arc<Controller>) {
    if controller.is_running() {
        println!("stopping daemon...");
        controller.stop();
    } else {
        println!("daemon is not running");
    }
}
