use crate::*;

#[tokio::test]
async fn two_nodes_learn_each_other() -> Result<()> {
    let net = line(2).await?;
    net.assert_converged(&[1, 2])?;
    assert_eq!(net.unicast_path(PeerName(1), PeerName(2))?, vec![PeerName(2)]);
    Ok(())
}

#[tokio::test]
async fn line_routes_through_middle() -> Result<()> {
    let net = line(5).await?;
    net.assert_converged(&[1, 2, 3, 4, 5])?;
    assert_eq!(
        net.unicast_path(PeerName(1), PeerName(5))?,
        vec![PeerName(2), PeerName(3), PeerName(4), PeerName(5)]
    );
    // A's broadcasts must be carried on by B, never back to A.
    assert_eq!(net.node(2).router.routes().broadcast(PeerName(1)), vec![PeerName(3)]);
    Ok(())
}

#[tokio::test]
async fn ring_takes_the_short_way_round() -> Result<()> {
    let net = ring(6).await?;
    net.assert_converged(&[1, 2, 3, 4, 5, 6])?;
    assert_eq!(net.unicast_path(PeerName(1), PeerName(6))?, vec![PeerName(6)]);
    assert_eq!(net.unicast_path(PeerName(1), PeerName(3))?.len(), 2);
    // Opposite side: two equal paths, the lower-named first hop wins.
    assert_eq!(net.unicast_path(PeerName(1), PeerName(4))?[0], PeerName(2));
    Ok(())
}

#[tokio::test]
async fn random_graphs_converge() -> Result<()> {
    for seed in 0..4 {
        let net = random_graph(8, 6, seed).await?;
        let members: Vec<u64> = (1..=8).collect();
        net.assert_converged(&members)
            .with_context(|| format!("seed {seed}"))?;
    }
    Ok(())
}

#[tokio::test]
async fn views_agree_on_versions() -> Result<()> {
    let net = random_graph(6, 4, 42).await?;
    for peer in net.all_names() {
        let versions: std::collections::HashSet<u64> = net
            .nodes
            .iter()
            .map(|n| n.view_of(peer).map(|p| p.version()))
            .collect::<Result<_>>()?;
        assert_eq!(versions.len(), 1, "nodes disagree on {peer}'s version");
    }
    Ok(())
}

#[tokio::test]
async fn unicast_frames_arrive() -> Result<()> {
    let net = random_graph(7, 3, 7).await?;
    for from in 1..=7 {
        for to in 1..=7 {
            if from == to {
                continue;
            }
            let visited = net.send(from, to, b"ping")?;
            assert_eq!(visited.last(), Some(&PeerName(to)));
            assert_eq!(
                visited,
                net.unicast_path(PeerName(from), PeerName(to))?,
                "frame strayed from the unicast route"
            );
        }
    }
    Ok(())
}
