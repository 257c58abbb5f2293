#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the memoria-core crate.
//!
//! Exercises the shipped `memoria.toml`, configuration validation, and the
//! wire shapes external producers rely on.

use std::collections::BTreeMap;
use std::path::PathBuf;

use memoria_core::{
    content_hash, Document, MemoriaConfig, MemoriaError, NewDocument, ReviewDecision, RiskLevel,
    Snapshot, SnapshotPhase,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn shipped_config_parses_and_matches_defaults() {
    let shipped = MemoriaConfig::from_toml_str(include_str!("../../../memoria.toml")).unwrap();
    let defaults = MemoriaConfig::default();

    assert_eq!(shipped.data_dir, PathBuf::from("./data"));
    assert_eq!(shipped.embedder.dimension, defaults.embedder.dimension);
    assert!(shipped.embedder.neural.is_none());
    assert_eq!(shipped.index.m, defaults.index.m);
    assert_eq!(shipped.index.exact_threshold, defaults.index.exact_threshold);
    assert_eq!(shipped.retrieval.default_k, defaults.retrieval.default_k);
    assert_eq!(
        shipped.proposals.auto_approve_below,
        defaults.proposals.auto_approve_below
    );
    assert_eq!(shipped.proposals.retry.max_retries, 3);
}

#[test]
fn partial_retry_section_keeps_other_defaults() {
    let config = MemoriaConfig::from_toml_str(
        r#"
        [proposals.retry]
        max_retries = 7
        "#,
    )
    .unwrap();
    assert_eq!(config.proposals.retry.max_retries, 7);
    assert_eq!(config.proposals.retry.backoff_base_ms, 500);
    assert_eq!(config.proposals.retry.backoff_max_ms, 30_000);
}

#[test]
fn neural_section_requires_endpoint_model_and_dimension() {
    let config = MemoriaConfig::from_toml_str(
        r#"
        [embedder.neural]
        endpoint = "http://localhost:11434"
        model = "nomic-embed-text"
        dimension = 768
        "#,
    )
    .unwrap();
    let neural = config.embedder.neural.unwrap();
    assert_eq!(neural.dimension, 768);
    assert_eq!(neural.timeout_ms, 10_000);
    assert!(neural.api_key.is_none());

    let err = MemoriaConfig::from_toml_str(
        r#"
        [embedder.neural]
        endpoint = "http://localhost:11434"
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, MemoriaError::Config(_)));
}

#[test]
fn invalid_index_settings_are_rejected() {
    for toml in [
        "[embedder]\ndimension = 0",
        "[index]\nm = 1",
        "[index]\nm = 32\nef_construction = 16",
        "[index]\nrebuild_segment_size = 0",
        "[retrieval]\nvector_weight = -1.0",
    ] {
        let err = MemoriaConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, MemoriaError::Config(_)), "accepted: {toml}");
    }
}

#[test]
fn unknown_risk_level_is_a_config_error() {
    let err = MemoriaConfig::from_toml_str(
        r#"
        [proposals]
        auto_approve_below = "extreme"
        "#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("Invalid TOML"));
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[test]
fn producer_json_without_metadata_is_accepted() {
    let new: NewDocument =
        serde_json::from_str(r#"{"source_type": "market_report", "text": "gold bullish momentum"}"#)
            .unwrap();
    assert!(new.metadata.is_empty());

    let doc = Document::from_new(new);
    assert_eq!(doc.content_hash, content_hash("gold bullish momentum"));
    assert_eq!(doc.raw_text, "gold bullish momentum");
}

#[test]
fn snapshot_phase_is_lowercase_on_disk() {
    let mut manifest = BTreeMap::new();
    manifest.insert("vector_index".to_string(), "len=10".to_string());
    let snapshot = Snapshot::new(Uuid::new_v4(), SnapshotPhase::Pre, manifest);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["phase"], "pre");
    assert_eq!(json["manifest"]["vector_index"], "len=10");
}

#[test]
fn review_decisions_carry_reviewer_and_reason() {
    let ok = ReviewDecision::approve("ops");
    assert!(ok.approved);
    assert!(ok.reason.is_none());

    let no = ReviewDecision::reject("ops", "market hours");
    assert!(!no.approved);
    assert_eq!(no.reason.as_deref(), Some("market hours"));
    assert_eq!(no.reviewer, "ops");
}

#[test]
fn risk_levels_sort_for_auto_approval() {
    let threshold = RiskLevel::Medium;
    let auto: Vec<RiskLevel> = [
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ]
    .into_iter()
    .filter(|r| *r < threshold)
    .collect();
    assert_eq!(auto, vec![RiskLevel::Low]);
}
