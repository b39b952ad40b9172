use htlc_swap::{
    Error, Expiry, HtlcContract, KeySigner, Network, ScriptVariant, Secret, SecretHash,
    decode_script,
};

struct Parties {
    redeemer: String,
    initiator: String,
}

fn parties(network: Network) -> Parties {
    let redeemer = KeySigner::from_hex(&"11".repeat(32)).expect("valid key");
    let initiator = KeySigner::from_hex(&"22".repeat(32)).expect("valid key");
    Parties {
        redeemer: redeemer.p2wpkh_address(network).to_string(),
        initiator: initiator.p2pkh_address(network).to_string(),
    }
}

fn secret_hash() -> SecretHash {
    Secret::new([0xab; 32]).hash()
}

fn build(expiry: Expiry, network: Network, variant: ScriptVariant) -> HtlcContract {
    let p = parties(network);
    HtlcContract::build(secret_hash(), &p.redeemer, &p.initiator, expiry, network, variant)
        .expect("contract should compile")
}

#[test]
fn compilation_is_deterministic() {
    for variant in [ScriptVariant::Legacy, ScriptVariant::Witness] {
        let a = build(Expiry::Blocks(144), Network::Testnet, variant);
        let b = build(Expiry::Blocks(144), Network::Testnet, variant);
        assert_eq!(a.script(), b.script());
        assert_eq!(a.address(), b.address());
        assert_eq!(a, b);
    }
}

#[test]
fn every_input_changes_the_address() {
    let base = build(Expiry::Blocks(144), Network::Testnet, ScriptVariant::Witness);
    let p = parties(Network::Testnet);

    let other_hash = HtlcContract::build(
        Secret::new([0xac; 32]).hash(),
        &p.redeemer,
        &p.initiator,
        Expiry::Blocks(144),
        Network::Testnet,
        ScriptVariant::Witness,
    )
    .unwrap();
    let swapped_roles = HtlcContract::build(
        secret_hash(),
        &p.initiator,
        &p.redeemer,
        Expiry::Blocks(144),
        Network::Testnet,
        ScriptVariant::Witness,
    )
    .unwrap();
    let other_expiry = build(Expiry::Blocks(145), Network::Testnet, ScriptVariant::Witness);
    let absolute = build(
        Expiry::Timestamp(1_800_000_000),
        Network::Testnet,
        ScriptVariant::Witness,
    );

    let addresses = [
        base.address().to_string(),
        other_hash.address().to_string(),
        swapped_roles.address().to_string(),
        other_expiry.address().to_string(),
        absolute.address().to_string(),
    ];
    for i in 0..addresses.len() {
        for j in (i + 1)..addresses.len() {
            assert_ne!(addresses[i], addresses[j], "contracts {i} and {j} collide");
        }
    }
}

#[test]
fn variant_determines_commitment() {
    let witness = build(Expiry::Blocks(10), Network::Regtest, ScriptVariant::Witness);
    let legacy = build(Expiry::Blocks(10), Network::Regtest, ScriptVariant::Legacy);

    let spk = witness.script_pubkey().as_bytes();
    assert_eq!(spk.len(), 34);
    assert_eq!(&spk[..2], &[0x00, 0x20]);
    assert!(witness.address().to_string().starts_with("bcrt1q"));

    let spk = legacy.script_pubkey().as_bytes();
    assert_eq!(spk.len(), 23);
    assert_eq!(spk[0], 0xa9); // OP_HASH160
    assert_eq!(spk[22], 0x87); // OP_EQUAL
    assert!(legacy.address().to_string().starts_with('2'));
}

#[test]
fn addresses_are_network_scoped() {
    let testnet = build(Expiry::Blocks(10), Network::Testnet, ScriptVariant::Witness);
    let mainnet = build(Expiry::Blocks(10), Network::Mainnet, ScriptVariant::Witness);
    assert_eq!(testnet.script(), mainnet.script());
    assert!(testnet.address().to_string().starts_with("tb1q"));
    assert!(mainnet.address().to_string().starts_with("bc1q"));
}

#[test]
fn empty_or_undecodable_addresses_are_rejected() {
    let p = parties(Network::Testnet);
    let cases = [
        ("", p.initiator.as_str()),
        (p.redeemer.as_str(), ""),
        ("   ", p.initiator.as_str()),
        ("tb1qnotanaddress", p.initiator.as_str()),
        (p.redeemer.as_str(), "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH"),
    ];
    for (redeemer, initiator) in cases {
        let result = HtlcContract::build(
            secret_hash(),
            redeemer,
            initiator,
            Expiry::Blocks(10),
            Network::Testnet,
            ScriptVariant::Witness,
        );
        assert!(
            matches!(result, Err(Error::InvalidAddress(_))),
            "{redeemer:?} / {initiator:?} should be rejected"
        );
    }
}

#[test]
fn script_addresses_cannot_be_parties() {
    let htlc = build(Expiry::Blocks(10), Network::Testnet, ScriptVariant::Witness);
    let p = parties(Network::Testnet);
    let result = HtlcContract::build(
        secret_hash(),
        &htlc.address().to_string(),
        &p.initiator,
        Expiry::Blocks(10),
        Network::Testnet,
        ScriptVariant::Witness,
    );
    assert!(matches!(result, Err(Error::InvalidAddress(_))));
}

#[test]
fn invalid_expiry_is_rejected() {
    let p = parties(Network::Testnet);
    for expiry in [Expiry::Blocks(0), Expiry::Timestamp(499_999_999)] {
        let result = HtlcContract::build(
            secret_hash(),
            &p.redeemer,
            &p.initiator,
            expiry,
            Network::Testnet,
            ScriptVariant::Witness,
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}

#[test]
fn counterpart_script_can_be_audited() {
    let theirs = build(
        Expiry::Timestamp(1_800_000_000),
        Network::Testnet,
        ScriptVariant::Witness,
    );
    let terms = decode_script(theirs.script()).expect("HTLC script decodes");
    assert_eq!(terms.secret_hash, secret_hash());
    assert_eq!(terms.expiry, Expiry::Timestamp(1_800_000_000));

    let rebuilt =
        HtlcContract::from_script(theirs.script(), ScriptVariant::Witness, Network::Testnet)
            .unwrap();
    assert_eq!(rebuilt.address(), theirs.address());
}
