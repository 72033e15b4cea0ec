use std::io;

use async_trait::async_trait;

use super::Collective;

/// A group made of a single rank, used by the single-process reference run.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCollective;

impl LocalCollective {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn all_gather_bytes(&mut self, local: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        Ok(vec![local.to_vec()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{all_gather, barrier};

    #[tokio::test]
    async fn gathers_only_itself() {
        let mut group = LocalCollective::new();

        let gathered = all_gather(&mut group, &[3i64, 4]).await.unwrap();
        assert_eq!(gathered, vec![vec![3, 4]]);
        barrier(&mut group).await.unwrap();
    }
}
