#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use libvfs::{LightRemoteInode, Vfs, VfsOptions};
use rkfs::error::Result;
use rkfs::protocol::{
    Command, CommandBody, FrameReader, FrameWriter, MasterFrame, NamedError, RemergeListing,
    Response, ResponseBody, SlaveFrame, frame_reader, frame_writer, read_frame, write_frame,
};
use rkfs::slave::{RemoteSlave, SlaveContext, SlaveManager, SlaveSettings};
use tempfile::TempDir;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .is_test(true)
            .init();
    });
}

pub struct Harness {
    pub tmp: TempDir,
    pub vfs: Arc<Vfs>,
    pub manager: Arc<SlaveManager>,
}

pub fn settings(tmp: &TempDir) -> SlaveSettings {
    SlaveSettings::with_slaves_dir(tmp.path().join("slaves"))
}

pub fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(&tmp);
    harness_with(tmp, settings)
}

pub fn harness_with(tmp: TempDir, settings: SlaveSettings) -> Harness {
    init_logging();
    let vfs = Vfs::open(tmp.path().join("vfs"), VfsOptions::default()).unwrap();
    let ctx = SlaveContext::new(Arc::clone(&vfs), settings);
    let manager = SlaveManager::load(ctx).unwrap();
    vfs.set_slave_ops(manager.clone());
    Harness { tmp, vfs, manager }
}

pub fn local_peer() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

/// The slave end of a session, driven by the test.
pub struct FakeSlave {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
}

impl FakeSlave {
    pub async fn send(&mut self, frame: SlaveFrame) {
        write_frame(&mut self.writer, &frame).await.unwrap();
    }

    pub async fn next_frame(&mut self) -> Option<MasterFrame> {
        tokio::time::timeout(Duration::from_secs(5), read_frame(&mut self.reader))
            .await
            .expect("master sent nothing within 5s")
            .unwrap()
    }

    pub async fn expect_command(&mut self) -> Command {
        match self.next_frame().await {
            Some(MasterFrame::Command(command)) => command,
            other => panic!("expected a command, got {other:?}"),
        }
    }

    pub async fn expect_error(&mut self) -> NamedError {
        match self.next_frame().await {
            Some(MasterFrame::Error(error)) => error,
            other => panic!("expected an error frame, got {other:?}"),
        }
    }

    pub async fn respond(&mut self, index: &str, body: ResponseBody) {
        self.send(SlaveFrame::Response(Response {
            index: index.to_string(),
            body,
        }))
        .await;
    }

    /// Answers the initial remerge request with a root listing of `files`.
    pub async fn finish_remerge(&mut self, files: Vec<LightRemoteInode>) {
        let command = self.expect_command().await;
        assert!(
            matches!(command.body, CommandBody::Remerge { ref path, .. } if path == "/"),
            "expected a remerge, got {command:?}"
        );
        self.send(SlaveFrame::Remerge(RemergeListing {
            path: "/".to_string(),
            last_modified: 1_700_000_000_000,
            files,
        }))
        .await;
        self.respond(&command.index, ResponseBody::Ok).await;
    }
}

/// Opens a session to `manager` from `peer` and identifies as `name`.
pub async fn dial(
    manager: &SlaveManager,
    name: &str,
    peer: SocketAddr,
) -> (Result<Arc<RemoteSlave>>, FakeSlave) {
    let (master_io, slave_io) = tokio::io::duplex(1 << 20);
    let (mr, mw) = tokio::io::split(master_io);
    let (sr, sw) = tokio::io::split(slave_io);
    let mut fake = FakeSlave {
        reader: frame_reader(sr),
        writer: frame_writer(sw),
    };
    fake.send(SlaveFrame::Hello {
        name: name.to_string(),
    })
    .await;
    let accepted = manager
        .accept_slave(peer, frame_reader(mr), frame_writer(mw))
        .await;
    (accepted, fake)
}

/// Registers `name` for localhost, connects it and completes its first
/// remerge with `files`.
pub async fn online_slave(
    manager: &SlaveManager,
    name: &str,
    files: Vec<LightRemoteInode>,
) -> (Arc<RemoteSlave>, FakeSlave) {
    let slave = match manager.remote_slave(name) {
        Ok(slave) => slave,
        Err(_) => {
            let slave = manager.new_slave(name).unwrap();
            slave.add_mask("*@127.0.0.1").unwrap();
            slave
        }
    };
    let (accepted, mut fake) = dial(manager, name, local_peer()).await;
    accepted.unwrap();
    fake.finish_remerge(files).await;
    wait_until(|| slave.is_available()).await;
    (slave, fake)
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
