#![cfg(feature = "live-nftfi-tests")]

use nft_ltv_depth::{
    aggregate, resolve_policy, NftfiClient, NftfiConfig, PolicyRequest, ReservoirClient,
    ReservoirConfig,
};

#[test]
fn live_nftfi_returns_loans_for_a_known_collection() {
    let client = NftfiClient::new(NftfiConfig {
        http_timeout_ms: 15_000,
        ..NftfiConfig::default()
    })
    .expect("nftfi client should build");

    let loans = client
        .fetch_collection_loans("Wrapped Cryptopunks")
        .expect("live nftfi fetch should succeed");

    assert!(
        loans.iter().all(|loan| !loan.loan_id.is_empty()),
        "normalized loans must carry an id"
    );
    println!("nftfi returned {} loans", loans.len());

    let floor = std::env::var("RESERVOIR_API_KEY")
        .ok()
        .and_then(|api_key| {
            let reservoir = ReservoirClient::new(ReservoirConfig {
                api_key: Some(api_key),
                ..ReservoirConfig::default()
            })
            .ok()?;
            reservoir
                .fetch_floor_price_usd("0xb7f7f6c52f2e2fdb1963eab30438024864c313f6")
                .ok()
        })
        .unwrap_or(100_000.0);

    let policy = resolve_policy(&PolicyRequest::default(), &loans, floor)
        .expect("default policy should resolve");
    let series = aggregate(&loans, floor, &policy);
    assert_eq!(
        series.valid_loans() + series.skipped_loans(),
        loans.len() as u64
    );
}
