//! Two engines exchanging a torrent over loopback

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use torrent_engine::config::generate_peer_id;
use torrent_engine::{
    create_descriptor, Config, DownloadState, MemoryStorage, Multiplexer, Outcome, Session, Torrent, TorrentMeta,
};

const PIECE: u32 = 16 * 1024;

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

fn config() -> Config {
    Config {
        start_port: 0,
        ..Config::default()
    }
}

#[test]
fn test_two_torrents_over_one_multiplexer() {
    let data = content(5 * PIECE as usize + 1234);
    let descriptor = create_descriptor("shared.bin", PIECE, &data, &[]).unwrap();
    let meta = TorrentMeta::from_bytes(&descriptor).unwrap();
    let config = config();
    // each end needs its own peer id or the handshake looks like a self-connection
    let leecher_config = Config {
        peer_id: generate_peer_id(),
        ..config.clone()
    };
    assert_ne!(config.peer_id, leecher_config.peer_id);

    let mut mux = Multiplexer::new().unwrap();
    let now = Instant::now();
    let mut torrents = vec![
        Torrent::with_backend(meta.clone(), Box::new(MemoryStorage::with_data(data.clone())), 0, &config),
        Torrent::with_backend(meta, Box::new(MemoryStorage::new(data.len() as u64)), 1, &leecher_config),
    ];
    assert_eq!(torrents[0].prepare(0, true, &mut mux, now), DownloadState::Completed);
    assert_eq!(torrents[1].prepare(0, false, &mut mux, now), DownloadState::None);

    let seeder: SocketAddr = ([127, 0, 0, 1], torrents[0].port()).into();
    torrents[1].add_candidates([seeder]);

    let deadline = Instant::now() + Duration::from_secs(30);
    while !torrents[1].is_finished() {
        assert!(Instant::now() < deadline, "download did not finish");
        assert!(!torrents[1].is_failed());
        let now = Instant::now();
        torrents[1].next_connection(&mut mux, now);
        for torrent in torrents.iter_mut() {
            torrent.tick(&mut mux, now);
        }
        mux.poll(Duration::from_millis(5), |owner, readiness, mux| {
            torrents[owner.torrent].dispatch(owner.endpoint, readiness, mux, now);
        })
        .unwrap();
    }

    let now = Instant::now();
    let leecher = torrents[1].stats(now);
    assert_eq!(leecher.completed_pieces, 6);
    assert_eq!(leecher.hash_misses, 0);
    assert!(leecher.downloaded >= data.len() as u64);
    assert!(torrents[0].stats(now).uploaded >= data.len() as u64);
    // at most one connection per remote address
    assert_eq!(torrents[1].active_peers(), 1);
}

/// Answers every announce with the seeder's address
fn spawn_tracker(seeder_port: Arc<AtomicU16>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let mut body = b"d8:intervali60e5:peers6:".to_vec();
            body.extend_from_slice(&[127, 0, 0, 1]);
            body.extend_from_slice(&seeder_port.load(Ordering::SeqCst).to_be_bytes());
            body.push(b'e');
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
        }
    });
    port
}

#[test]
fn test_sessions_find_each_other_through_tracker() {
    let seeder_port = Arc::new(AtomicU16::new(0));
    let tracker_port = spawn_tracker(seeder_port.clone());

    let data = content(3 * PIECE as usize + 77);
    let announce = format!("http://127.0.0.1:{}/announce", tracker_port);
    let descriptor = create_descriptor("movie.bin", PIECE, &data, &[announce]).unwrap();

    let scratch = tempfile::tempdir().unwrap();
    let torrent_path = scratch.path().join("movie.torrent");
    fs::write(&torrent_path, &descriptor).unwrap();
    let seed_dir = scratch.path().join("seed");
    let leech_dir = scratch.path().join("leech");
    fs::create_dir_all(&seed_dir).unwrap();
    fs::write(seed_dir.join("movie.bin"), &data).unwrap();

    let mut seeder = Session::new(Config {
        download_dir: seed_dir,
        ..config()
    })
    .unwrap();
    seeder.add(&torrent_path).unwrap();
    assert_eq!(seeder.prepare_all(Instant::now())[0].1, DownloadState::Completed);
    seeder_port.store(seeder.torrent(0).unwrap().port(), Ordering::SeqCst);

    let mut leecher = Session::new(Config {
        download_dir: leech_dir.clone(),
        seed: false,
        ..config()
    })
    .unwrap();
    leecher.add(&torrent_path).unwrap();
    assert_eq!(leecher.prepare_all(Instant::now())[0].1, DownloadState::None);

    let deadline = Instant::now() + Duration::from_secs(30);
    while !leecher.is_download_done() {
        assert!(Instant::now() < deadline, "download did not finish");
        leecher.download_step(Instant::now()).unwrap();
        seeder.download_step(Instant::now()).unwrap();
    }

    assert_eq!(leecher.report()[0].2, Outcome::Completed);
    assert_eq!(fs::read(leech_dir.join("movie.bin")).unwrap(), data);
    leecher.shutdown(Instant::now());
    seeder.shutdown(Instant::now());
}
