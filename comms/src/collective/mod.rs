//! Collective operations between the workers of a run.
//!
//! Every worker calls the same sequence of collective operations; each call
//! returns once every rank has contributed, with the contributions ordered by
//! rank.

mod local;
mod tcp;

use std::io;

use async_trait::async_trait;
use bytemuck::Pod;

pub use local::LocalCollective;
pub use tcp::TcpCollective;

/// A group of ranks that exchange byte buffers in lock step.
#[async_trait]
pub trait Collective: Send {
    /// The rank of this process in the group.
    fn rank(&self) -> usize;

    /// The amount of ranks in the group.
    fn world_size(&self) -> usize;

    /// Contributes `local` and waits for every rank's contribution.
    ///
    /// # Returns
    /// One buffer per rank, indexed by rank.
    async fn all_gather_bytes(&mut self, local: &[u8]) -> io::Result<Vec<Vec<u8>>>;

    /// Tells the other ranks this one failed, so they stop waiting on it.
    async fn abort(&mut self, _reason: &str) {}

    /// Leaves the group.
    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Typed all-gather: every rank contributes a slice of plain numbers.
///
/// # Arguments
/// * `collective` - The group to gather over.
/// * `local` - This rank's contribution.
///
/// # Returns
/// One vector per rank, indexed by rank.
pub async fn all_gather<C, T>(collective: &mut C, local: &[T]) -> io::Result<Vec<Vec<T>>>
where
    C: Collective + ?Sized,
    T: Pod,
{
    let gathered = collective
        .all_gather_bytes(bytemuck::cast_slice(local))
        .await?;

    gathered
        .into_iter()
        .enumerate()
        .map(|(rank, bytes)| {
            if bytes.len() % size_of::<T>() != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "rank {rank} sent {} bytes, not a multiple of {}",
                        bytes.len(),
                        size_of::<T>()
                    ),
                ));
            }
            Ok(bytemuck::pod_collect_to_vec::<u8, T>(&bytes))
        })
        .collect()
}

/// Waits until every rank reaches this point.
pub async fn barrier<C>(collective: &mut C) -> io::Result<()>
where
    C: Collective + ?Sized,
{
    collective.all_gather_bytes(&[]).await.map(|_| ())
}
