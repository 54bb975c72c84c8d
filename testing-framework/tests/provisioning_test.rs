// Provisioning against the in-process dev chain

mod common;

use common::{Fixture, SimNetwork, DEPOSIT, TOKEN};
use pcn_testing_framework::orchestrator::PhaseFailure;
use pcn_testing_framework::prelude::*;
use pcn_testing_framework::provisioning::AllowanceKey;

/// Provision under a deadline, so a stalled phase fails the test instead of
/// hanging it, and unwrap the phase failure
async fn provision_phase_failure(fixture: &Fixture) -> PhaseFailure {
    let provisioner = fixture.provisioner();
    let nodes = SimNetwork::default();
    let run = provisioner.provision(&fixture.config, &nodes);
    let err = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("provisioning stalled instead of failing")
        .unwrap_err();
    match err {
        ProvisionError::Phase(failure) => failure,
        other => panic!("expected a phase failure, got {other}"),
    }
}

/// Every failure is the injected one or a task cancelled because of it
fn assert_caused_by(failure: &PhaseFailure, cause: &str) {
    assert!(
        failure.failures.iter().any(|f| f.cause.contains(cause)),
        "{failure}"
    );
    for task in &failure.failures {
        assert!(
            task.cause.contains(cause) || task.cause.starts_with("cancelled after"),
            "{}",
            task
        );
    }
}

#[tokio::test]
async fn test_provision_deposits_both_sides_without_locks() {
    common::init_logging();
    let fixture = Fixture::send06();
    let stale = fixture.config.data_dir.join("0x02/db");
    std::fs::create_dir_all(&stale).unwrap();

    let nodes = SimNetwork::default();
    let provisioner = fixture.provisioner();
    let topology = provisioner.provision(&fixture.config, &nodes).await.unwrap();

    assert_eq!(topology.nodes.len(), 4);
    assert_eq!(topology.channels.len(), 4);
    let token = topology.token(TOKEN).unwrap();
    assert!(token.deployed);

    // One deposit per side, one approval per depositing account
    assert_eq!(fixture.chain.tx_count(TxKind::Deposit), 8);
    assert_eq!(fixture.chain.tx_count(TxKind::Approve), 4);
    assert_eq!(fixture.chain.tx_count(TxKind::Transfer), 4);

    for spec in &topology.channels {
        let a = topology.node(&spec.a).unwrap();
        let b = topology.node(&spec.b).unwrap();
        let on_chain = fixture
            .chain
            .channel(&topology.settlement, &token.address, &a.address, &b.address)
            .await
            .unwrap();
        assert!(on_chain.exists, "{}-{}", spec.a, spec.b);
        assert_eq!((on_chain.deposit_a, on_chain.deposit_b), (DEPOSIT, DEPOSIT));
        assert_eq!(on_chain.settle_timeout, 100);
    }

    // N3 is in three channels, N2 in two
    let settings = provisioner.settings();
    let n3 = topology.node("N3").unwrap().address;
    let n2 = topology.node("N2").unwrap().address;
    assert_eq!(
        fixture.chain.token_balance(&token.address, &n3).await.unwrap(),
        settings.funding_amount - 3 * DEPOSIT
    );
    assert_eq!(
        fixture.chain.token_balance(&token.address, &n2).await.unwrap(),
        settings.funding_amount - 2 * DEPOSIT
    );

    // The cache holds the multiplied grant, the chain what is left of it
    let key = AllowanceKey {
        spender: topology.settlement,
        owner: n3,
        token: token.address,
    };
    let granted = DEPOSIT * Amount::from(settings.allowance_multiplier);
    assert_eq!(provisioner.allowances().recorded(&key).await, Some(granted));
    assert_eq!(
        fixture
            .chain
            .allowance(&token.address, &n3, &topology.settlement)
            .await
            .unwrap(),
        granted - 3 * DEPOSIT
    );

    // Two deployments and four funding transfers from the deployer
    assert_eq!(fixture.chain.pending_nonce(&fixture.deployer).await.unwrap(), 6);

    // Step 4: stale nodes killed and persisted state removed
    assert_eq!(nodes.kill_all_calls(), 1);
    assert!(!fixture.config.data_dir.exists());

    // Nothing is locked right after provisioning
    let sim = SimNetwork::new(&topology);
    for node in &topology.nodes {
        sim.start(node).await.unwrap();
    }
    let probe = ChannelStateProbe::new(
        fixture.chain.clone(),
        Arc::new(sim.clone()),
        Arc::new(sim),
        topology.settlement,
    );
    for spec in &topology.channels {
        let snapshot = probe
            .snapshot(
                topology.node(&spec.a).unwrap(),
                topology.node(&spec.b).unwrap(),
                &token.address,
            )
            .await
            .unwrap();
        assert!(snapshot.locks_observed());
        assert_eq!((snapshot.locked_a, snapshot.locked_b), (0, 0));
        assert_eq!((snapshot.deposit_a, snapshot.deposit_b), (DEPOSIT, DEPOSIT));
    }
}

#[tokio::test]
async fn test_same_config_yields_same_topology() {
    let first = Fixture::send06().provision().await;
    let second = Fixture::send06().provision().await;
    assert_eq!(first, second);
    assert_eq!(
        first.to_pretty_json().unwrap(),
        second.to_pretty_json().unwrap()
    );
}

#[tokio::test]
async fn test_reused_token_skips_channels() {
    let mut fixture = Fixture::send06();
    let deployer = fixture.keys.get(&fixture.deployer).unwrap();
    let token = fixture
        .chain
        .deploy_contract(
            &deployer,
            0,
            ContractKind::Token {
                initial_supply: 1_000,
                symbol: "OLD".into(),
                decimals: 0,
            },
        )
        .await
        .unwrap();
    fixture.config.tokens[0].address = ContractRef::Existing(token);

    let topology = fixture.provision().await;
    let descriptor = topology.token(TOKEN).unwrap();
    assert_eq!(descriptor.address, token);
    assert!(!descriptor.deployed);
    assert!(topology.uses_reused_token());
    // Specs are kept for lookups even though nothing was deposited
    assert_eq!(topology.channels.len(), 4);
    assert!(topology.channel_between("N3", "N2", TOKEN).is_some());

    assert_eq!(fixture.chain.tx_count(TxKind::DeployToken), 1);
    assert_eq!(fixture.chain.tx_count(TxKind::Transfer), 0);
    assert_eq!(fixture.chain.tx_count(TxKind::Approve), 0);
    assert_eq!(fixture.chain.tx_count(TxKind::Deposit), 0);
}

#[tokio::test]
async fn test_existing_settlement_is_reused() {
    let mut fixture = Fixture::send06();
    let deployer = fixture.keys.get(&fixture.deployer).unwrap();
    let settlement = fixture
        .chain
        .deploy_contract(&deployer, 0, ContractKind::Settlement)
        .await
        .unwrap();
    fixture.config.settlement_contract = ContractRef::Existing(settlement);

    let topology = fixture.provision().await;
    assert_eq!(topology.settlement, settlement);
    assert_eq!(fixture.chain.tx_count(TxKind::DeploySettlement), 1);
    assert_eq!(fixture.chain.tx_count(TxKind::Deposit), 8);
}

#[tokio::test]
async fn test_settlement_address_without_code_is_rejected() {
    let mut fixture = Fixture::send06();
    let bogus = Address::new([0xee; 20]);
    fixture.config.settlement_contract = ContractRef::Existing(bogus);

    let err = fixture
        .provisioner()
        .provision(&fixture.config, &SimNetwork::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::NoContract(a) if a == bogus));
    assert_eq!(fixture.chain.total_tx_count(), 0);
}

#[tokio::test]
async fn test_deposit_failure_fails_the_phase() {
    let fixture = Fixture::send06();
    fixture.chain.fail_next(TxKind::Deposit, 2);

    let failure = provision_phase_failure(&fixture).await;
    assert_eq!(failure.phase, "channel deposits");
    assert_eq!(failure.total, 8);
    assert_caused_by(&failure, "Deposit into channel");
}

#[tokio::test]
async fn test_funding_failure_stops_before_channels() {
    let fixture = Fixture::send06();
    fixture.chain.fail_next(TxKind::Transfer, 1);

    let failure = provision_phase_failure(&fixture).await;
    assert!(failure.phase.starts_with("funding"));
    assert_caused_by(&failure, "Failed to fund");
    assert_eq!(fixture.chain.tx_count(TxKind::Deposit), 0);
}

#[tokio::test]
async fn test_lost_funding_submission_fails_instead_of_stalling() {
    let fixture = Fixture::send06();
    // The lost transfer leaves its deployer nonce unused; later transfers
    // queue behind it and are never mined
    fixture.chain.drop_next_send(TxKind::Transfer, 1);

    let failure = provision_phase_failure(&fixture).await;
    assert!(failure.phase.starts_with("funding"));
    assert_eq!(failure.total, 4);
    assert_caused_by(&failure, "connection reset");
    assert_eq!(fixture.chain.tx_count(TxKind::Deposit), 0);
}

#[tokio::test]
async fn test_lost_deposit_submission_fails_instead_of_stalling() {
    let fixture = Fixture::send06();
    fixture.chain.drop_next_send(TxKind::Deposit, 1);

    let failure = provision_phase_failure(&fixture).await;
    assert_eq!(failure.phase, "channel deposits");
    assert_caused_by(&failure, "connection reset");
    assert!(fixture.chain.tx_count(TxKind::Deposit) < 8);
}

#[tokio::test]
async fn test_account_without_key_is_rejected_before_any_transaction() {
    let mut fixture = Fixture::send06();
    fixture.config.nodes[1].address = Address::new([0x33; 20]);

    let err = fixture
        .provisioner()
        .provision(&fixture.config, &SimNetwork::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::MissingAccount { ref node, .. } if node == "N3"));
    assert_eq!(fixture.chain.total_tx_count(), 0);
}

#[tokio::test]
async fn test_invalid_topology_is_rejected_before_any_transaction() {
    let mut fixture = Fixture::send06();
    fixture.config.channels[0].b = "N9".into();

    let err = fixture
        .provisioner()
        .provision(&fixture.config, &SimNetwork::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Config(_)));
    assert_eq!(fixture.chain.total_tx_count(), 0);
}

#[tokio::test]
async fn test_unreachable_chain_fails_provisioning() {
    let fixture = Fixture::send06();
    fixture.chain.set_fail_reads(true);

    let err = fixture
        .provisioner()
        .provision(&fixture.config, &SimNetwork::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("settlement deployment nonce"), "{err}");
}
