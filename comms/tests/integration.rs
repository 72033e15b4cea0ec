use std::{net::TcpListener, time::Duration};

use comms::{
    Collective, TcpCollective, all_gather, barrier,
    msg::{Command, Msg},
    specs::ClusterSpec,
};
use tokio::io;

const TIMEOUT: Duration = Duration::from_secs(10);

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn send_recv() {
    const SIZE: usize = 128;

    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let nums = [7i64, -1, 42];
    tx.send(&Msg::Data(bytemuck::cast_slice(&nums))).await.unwrap();
    tx.send(&Msg::Control(Command::Disconnect)).await.unwrap();

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);
    let mut buf = Vec::new();

    match rx.recv_into::<Msg>(&mut buf).await.unwrap() {
        Msg::Data(bytes) => assert_eq!(bytemuck::pod_collect_to_vec::<u8, i64>(bytes), nums),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        rx.recv_into::<Msg>(&mut buf).await.unwrap(),
        Msg::Control(Command::Disconnect)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_all_gather_orders_by_rank() {
    const WORLD: usize = 3;

    let port = free_port();
    let ips = ["127.0.0.1"; WORLD];

    let mut handles = Vec::new();
    // Start the highest rank first so the retry path is exercised.
    for rank in (0..WORLD).rev() {
        let spec = ClusterSpec::build(&ips, rank, port).unwrap();
        handles.push(tokio::spawn(async move {
            let mut group = TcpCollective::connect(&spec, TIMEOUT).await?;
            assert_eq!(group.rank(), rank);

            let local: Vec<f32> = (0..=rank).map(|i| (rank * 10 + i) as f32).collect();
            let first = all_gather(&mut group, &local).await?;
            let second = all_gather(&mut group, &[rank as i64]).await?;
            barrier(&mut group).await?;
            group.shutdown().await?;

            std::io::Result::Ok((first, second))
        }));
    }

    for handle in handles {
        let (first, second) = handle.await.unwrap().unwrap();
        assert_eq!(first, vec![vec![0.0], vec![10.0, 11.0], vec![20.0, 21.0, 22.0]]);
        assert_eq!(second, vec![vec![0], vec![1], vec![2]]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_reaches_the_other_ranks() {
    let port = free_port();
    let ips = ["127.0.0.1"; 2];

    let root_spec = ClusterSpec::build(&ips, 0, port).unwrap();
    let root = tokio::spawn(async move {
        let mut group = TcpCollective::connect(&root_spec, TIMEOUT).await.unwrap();
        all_gather(&mut group, &[1.0f32]).await
    });

    let spec = ClusterSpec::build(&ips, 1, port).unwrap();
    let mut group = TcpCollective::connect(&spec, TIMEOUT).await.unwrap();
    group.abort("out of memory").await;

    let err = root.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("out of memory"), "{err}");
}

#[tokio::test]
async fn single_rank_opens_no_sockets() {
    // Port 1 is privileged, binding it would fail if it were attempted.
    let spec = ClusterSpec::build(&["127.0.0.1"], 0, 1).unwrap();
    let mut group = TcpCollective::connect(&spec, TIMEOUT).await.unwrap();

    assert_eq!(all_gather(&mut group, &[5u32]).await.unwrap(), vec![vec![5]]);
}
