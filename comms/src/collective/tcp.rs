use std::{io, time::Duration};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::{self, Instant},
};

use super::Collective;
use crate::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg},
    specs::ClusterSpec,
};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

type NetRx = OnoReceiver<OwnedReadHalf>;
type NetTx = OnoSender<OwnedWriteHalf>;

struct Peer {
    rank: usize,
    rx: NetRx,
    tx: NetTx,
}

/// A star shaped group over TCP: rank 0 listens on its cluster address and relays
/// every contribution to every other rank.
pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    /// Rank 0 holds one peer per other rank, sorted by rank. Other ranks hold rank 0.
    peers: Vec<Peer>,
    buf: Vec<u8>,
}

impl TcpCollective {
    /// Joins the group described by `cluster`.
    ///
    /// # Arguments
    /// * `cluster` - Worker addresses and this process's task index.
    /// * `timeout` - How long to wait for the rest of the group to show up.
    ///
    /// # Returns
    /// The connected group or an io error if the group could not be formed in time.
    pub async fn connect(cluster: &ClusterSpec, timeout: Duration) -> io::Result<Self> {
        let rank = cluster.rank();
        let world_size = cluster.world_size();

        if rank >= world_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rank {rank} is out of range for a group of {world_size}"),
            ));
        }

        let mut group = Self {
            rank,
            world_size,
            peers: Vec::with_capacity(world_size.saturating_sub(1)),
            buf: Vec::new(),
        };

        if world_size == 1 {
            return Ok(group);
        }

        let root_addr = cluster.workers()[0].as_str();
        let deadline = Instant::now() + timeout;

        if rank == 0 {
            group.accept_peers(root_addr, deadline).await?;
        } else {
            group.join_root(root_addr, deadline).await?;
        }

        info!(rank = rank, world_size = world_size; "collective group formed");
        Ok(group)
    }

    async fn accept_peers(&mut self, addr: &str, deadline: Instant) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        debug!(addr = addr; "root listening");

        let mut slots: Vec<Option<Peer>> = (0..self.world_size).map(|_| None).collect();
        let mut missing = self.world_size - 1;

        while missing > 0 {
            let (stream, from) = time::timeout_at(deadline, listener.accept())
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{missing} worker(s) never joined the group"),
                    )
                })??;
            stream.set_nodelay(true)?;

            let (rx, tx) = stream.into_split();
            let (mut rx, tx) = crate::channel(rx, tx);

            let join = time::timeout_at(deadline, rx.recv_into::<Msg>(&mut self.buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "join message never arrived"))??;

            let task_id = match join {
                Msg::Control(Command::Join {
                    task_id,
                    world_size,
                }) if world_size == self.world_size => task_id,
                Msg::Control(Command::Join { world_size, .. }) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "peer at {from} expects a group of {world_size}, this one has {}",
                            self.world_size
                        ),
                    ));
                }
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("expected a join message from {from}, got {}", other.kind()),
                    ));
                }
            };

            if task_id == 0 || !matches!(slots.get(task_id), Some(None)) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("peer at {from} claims invalid or duplicate task id {task_id}"),
                ));
            }

            debug!(task_id = task_id, from:% = from; "peer joined");
            slots[task_id] = Some(Peer { rank: task_id, rx, tx });
            missing -= 1;
        }

        self.peers = slots.into_iter().flatten().collect();
        Ok(())
    }

    async fn join_root(&mut self, addr: &str, deadline: Instant) -> io::Result<()> {
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() + RETRY_INTERVAL < deadline => {
                    debug!(addr = addr, error:% = e; "root not reachable yet, retrying");
                    time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("could not reach rank 0 at {addr}: {e}"),
                    ));
                }
            }
        };
        stream.set_nodelay(true)?;

        let (rx, tx) = stream.into_split();
        let (rx, mut tx) = crate::channel(rx, tx);

        let join = Msg::Control(Command::Join {
            task_id: self.rank,
            world_size: self.world_size,
        });
        tx.send(&join).await?;

        self.peers.push(Peer { rank: 0, rx, tx });
        Ok(())
    }
}

/// Receives one data frame from `peer`, turning error and disconnect frames into io errors.
async fn recv_data(peer: &mut Peer, buf: &mut Vec<u8>) -> io::Result<Vec<u8>> {
    match peer.rx.recv_into::<Msg>(buf).await? {
        Msg::Data(bytes) => Ok(bytes.to_vec()),
        Msg::Err(detail) => Err(io::Error::other(format!(
            "rank {} aborted: {detail}",
            peer.rank
        ))),
        other => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("rank {} left the group ({})", peer.rank, other.kind()),
        )),
    }
}

#[async_trait]
impl Collective for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_gather_bytes(&mut self, local: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let Self {
            rank,
            world_size,
            peers,
            buf,
        } = self;

        if *world_size == 1 {
            return Ok(vec![local.to_vec()]);
        }

        if *rank == 0 {
            let mut gathered = vec![Vec::new(); *world_size];
            gathered[0] = local.to_vec();

            for peer in peers.iter_mut() {
                gathered[peer.rank] = recv_data(peer, buf).await?;
            }

            for peer in peers.iter_mut() {
                for chunk in &gathered {
                    peer.tx.send(&Msg::Data(chunk)).await?;
                }
            }

            return Ok(gathered);
        }

        let root = &mut peers[0];
        root.tx.send(&Msg::Data(local)).await?;

        let mut gathered = Vec::with_capacity(*world_size);
        for _ in 0..*world_size {
            gathered.push(recv_data(root, buf).await?);
        }

        Ok(gathered)
    }

    async fn abort(&mut self, reason: &str) {
        for peer in self.peers.iter_mut() {
            if let Err(e) = peer.tx.send(&Msg::Err(reason.into())).await {
                warn!(rank = peer.rank, error:% = e; "could not notify peer of abort");
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        for peer in self.peers.iter_mut() {
            peer.tx.send(&Msg::Control(Command::Disconnect)).await?;
            peer.tx.shutdown().await?;
        }
        self.peers.clear();
        Ok(())
    }
}
