use crate::*;

fn assert_exactly_once(net: &Net, origin: u64) -> Result<()> {
    let received = net.flood(origin, b"hello everyone")?;
    for node in &net.nodes {
        let copies = received.get(&node.name()).copied().unwrap_or(0);
        let expected = usize::from(node.name() != PeerName(origin));
        if copies != expected {
            bail!(
                "broadcast from {origin}: {} got {copies} copies, expected {expected}",
                node.name()
            );
        }
    }
    Ok(())
}

#[tokio::test]
async fn line_broadcast_reaches_everyone_once() -> Result<()> {
    let net = line(4).await?;
    for origin in 1..=4 {
        assert_exactly_once(&net, origin)?;
    }
    Ok(())
}

#[tokio::test]
async fn ring_broadcast_does_not_loop() -> Result<()> {
    let net = ring(5).await?;
    for origin in 1..=5 {
        assert_exactly_once(&net, origin)?;
    }
    Ok(())
}

#[tokio::test]
async fn full_mesh_broadcast_is_direct() -> Result<()> {
    let mut net = Net::new(4);
    for a in 1..=4 {
        for b in (a + 1)..=4 {
            net.connect(a, b).await?;
        }
    }
    for origin in 1..=4 {
        assert_exactly_once(&net, origin)?;
        // Everyone hears it straight from the origin, so nobody relays.
        for node in &net.nodes {
            if node.name() != PeerName(origin) {
                assert!(node.router.routes().broadcast(PeerName(origin)).is_empty());
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn random_graph_broadcast_is_exactly_once() -> Result<()> {
    for seed in 10..14 {
        let net = random_graph(9, 8, seed).await?;
        for origin in 1..=9 {
            assert_exactly_once(&net, origin).with_context(|| format!("seed {seed}"))?;
        }
    }
    Ok(())
}
