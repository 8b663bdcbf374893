//! Property tests for the pure helpers the pipeline leans on
//!
//! These functions sit on hot paths (every progress write, every planning
//! round, every aggregation) and their invariants are what the rest of the
//! engine assumes. Each block below pins one of those invariants across
//! generated inputs.

use proptest::prelude::*;
use std::time::Duration;

use foreman_engine::config::Config;
use foreman_engine::db::deliverables::normalize_title;
use foreman_engine::db::goals::clamped_next;
use foreman_engine::pipeline::assets::descriptor;
use foreman_engine::pipeline::memory::content_hash;
use foreman_engine::pipeline::planner::jaccard_similarity;
use foreman_engine::pipeline::AssetKind;
use foreman_engine::provider::{extract_json_value, RetryPolicy};

// Every goal progress write goes through clamped_next: the stored value
// must never move backwards and never overshoot the target.
proptest! {
    #[test]
    fn test_progress_updates_monotone_and_capped(
        target in 1.0..=1000.0f64,
        current_frac in 0.0..=1.0f64,
        requested in -1000.0..=10_000.0f64,
    ) {
        let current = target * current_frac;
        let next = clamped_next(current, target, requested);

        prop_assert!(next >= current, "progress moved backwards: {} < {}", next, current);
        prop_assert!(next <= target, "progress overshot target: {} > {}", next, target);

        // An in-range request is honored exactly
        if requested >= current && requested <= target {
            prop_assert_eq!(next, requested);
        }

        // Re-applying the stored value changes nothing
        prop_assert_eq!(clamped_next(next, target, next), next);
    }
}

// Duplicate-intent detection compares word sets. The score must be a
// proper similarity: bounded, symmetric, and indifferent to case.
proptest! {
    #[test]
    fn test_jaccard_similarity_is_a_bounded_symmetric_score(
        a in "[a-z]{1,8}( [a-z]{1,8}){0,6}",
        b in "[a-z]{1,8}( [a-z]{1,8}){0,6}",
    ) {
        let score = jaccard_similarity(&a, &b);
        prop_assert!((0.0..=1.0).contains(&score));
        prop_assert_eq!(score, jaccard_similarity(&b, &a));

        prop_assert_eq!(jaccard_similarity(&a, &a), 1.0);
        prop_assert_eq!(jaccard_similarity(&a.to_uppercase(), &a), 1.0);
    }

    #[test]
    fn test_jaccard_similarity_blank_text_never_matches(
        a in "[a-z]{1,8}( [a-z]{1,8}){0,6}",
        blank in "[ \t]{0,10}",
    ) {
        prop_assert_eq!(jaccard_similarity(&a, &blank), 0.0);
        prop_assert_eq!(jaccard_similarity(&blank, &blank), 0.0);
    }
}

// Deliverable identity rests on normalized titles: normalization must be
// idempotent and blind to case and punctuation, or retitled deliverables
// would silently fork.
proptest! {
    #[test]
    fn test_title_normalization_is_canonical(title in "[ -~]{0,60}") {
        let normalized = normalize_title(&title);

        prop_assert_eq!(&normalize_title(&normalized), &normalized);
        prop_assert_eq!(&normalize_title(&title.to_uppercase()), &normalized);

        // Swapping punctuation for spaces lands on the same canonical form
        let spaced: String = title
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        prop_assert_eq!(&normalize_title(&spaced), &normalized);

        prop_assert!(normalized
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == ' '));
        prop_assert!(!normalized.starts_with(' '));
        prop_assert!(!normalized.ends_with(' '));
        prop_assert!(!normalized.contains("  "));
    }
}

// Insight dedup keys on a hash of the normalized content, so trivial
// reformatting must collapse to one key and distinct content must not.
proptest! {
    #[test]
    fn test_content_hash_ignores_formatting_only(
        content in "[a-zA-Z0-9]{1,12}( [a-zA-Z0-9]{1,12}){0,6}",
        padding in "[ \t]{1,5}",
    ) {
        let hash = content_hash(&content);
        prop_assert_eq!(hash.len(), 64);
        prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        let padded = format!("{padding}{}{padding}", content.replace(' ', "  "));
        prop_assert_eq!(&content_hash(&padded), &hash);
        prop_assert_eq!(&content_hash(&content.to_uppercase()), &hash);
    }

    #[test]
    fn test_content_hash_separates_distinct_content(
        a in "[a-z]{1,12}( [a-z]{1,12}){0,4}",
        b in "[a-z]{1,12}( [a-z]{1,12}){0,4}",
    ) {
        let canon = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        if canon(&a) != canon(&b) {
            prop_assert_ne!(content_hash(&a), content_hash(&b));
        } else {
            prop_assert_eq!(content_hash(&a), content_hash(&b));
        }
    }
}

// Backoff delays must grow without ever shrinking or blowing past the
// configured ceiling, whatever exponent the retry loop reaches.
proptest! {
    #[test]
    fn test_backoff_delays_nondecreasing_and_capped(
        base_ms in 1..=2_000u64,
        max_ms in 1..=120_000u64,
        exponent in 0..=64u32,
    ) {
        let policy = RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(base_ms),
            max_backoff: Duration::from_millis(max_ms),
        };

        let delay = policy.delay_for(exponent);
        prop_assert!(delay <= policy.max_backoff);
        prop_assert!(delay <= policy.delay_for(exponent + 1));

        prop_assert_eq!(
            policy.delay_for(0),
            Duration::from_millis(base_ms.min(max_ms))
        );
    }
}

// Asset descriptors are the dedup key for deliverable merging: the same
// task and shape must always map to one name, different tasks never.
proptest! {
    #[test]
    fn test_asset_descriptors_stable_per_task_and_shape(
        task_a in "[a-z0-9]{4,16}",
        task_b in "[a-z0-9]{4,16}",
        key in "[a-z]{1,10}",
    ) {
        let mut shape = serde_json::Map::new();
        shape.insert(key, serde_json::json!([1, 2, 3]));
        let content = serde_json::Value::Object(shape);

        for kind in [
            AssetKind::ContactList,
            AssetKind::MessageSequence,
            AssetKind::Document,
            AssetKind::StructuredTable,
            AssetKind::GenericContent,
        ] {
            let name = descriptor(kind, &task_a, &content);
            prop_assert_eq!(&descriptor(kind, &task_a, &content), &name);
            let prefix = format!("{}-", kind.slug());
            prop_assert!(name.starts_with(&prefix));
            prop_assert_eq!(name.len(), kind.slug().len() + 1 + 12);

            if task_a != task_b {
                prop_assert_ne!(descriptor(kind, &task_b, &content), name);
            }
        }
    }
}

// Models wrap JSON in fences and prose; the extractor must recover the
// same value from every wrapping it claims to handle.
proptest! {
    #[test]
    fn test_json_extraction_survives_model_wrappings(
        fields in proptest::collection::btree_map(
            "[a-z]{1,8}",
            "[a-zA-Z0-9 ]{0,20}",
            1..4,
        ),
    ) {
        let expected = serde_json::to_value(&fields).unwrap();
        let raw = serde_json::to_string(&expected).unwrap();

        let from_raw = extract_json_value(&raw);
        prop_assert_eq!(from_raw.as_ref(), Some(&expected));

        let fenced = format!("```json\n{raw}\n```");
        let from_fenced = extract_json_value(&fenced);
        prop_assert_eq!(from_fenced.as_ref(), Some(&expected));

        let chatty = format!(
            "Here is the result you asked for:\n```json\n{raw}\n```\nLet me know if it needs changes."
        );
        let from_chatty = extract_json_value(&chatty);
        prop_assert_eq!(from_chatty.as_ref(), Some(&expected));

        let embedded = format!("The result: {raw} as requested.");
        let from_embedded = extract_json_value(&embedded);
        prop_assert_eq!(from_embedded.as_ref(), Some(&expected));
    }
}

// A config written back to TOML must read back to the same settings, or
// repeated load and save would drift the file contents.
proptest! {
    #[test]
    fn test_config_round_trips_through_toml(
        log_level in "error|warn|info|debug|trace",
        default_provider in "openai|anthropic",
        accept_threshold in 0.0..=1.0f64,
        max_retries in 0..=10u32,
        max_concurrent in 1..=32usize,
        cycle_interval in 1..=3600u64,
    ) {
        let mut config: Config = toml::from_str("").expect("empty config loads defaults");
        config.core.log_level = log_level;
        config.provider.default_provider = default_provider;
        config.provider.max_retries = max_retries;
        config.quality.accept_threshold = accept_threshold;
        config.executor.max_concurrent_tasks = max_concurrent;
        config.orchestrator.cycle_interval_secs = cycle_interval;

        let rendered = toml::to_string(&config).expect("config serializes");
        let parsed: Config = toml::from_str(&rendered).expect("rendered config parses");

        prop_assert_eq!(config.core.log_level, parsed.core.log_level);
        prop_assert_eq!(config.provider.default_provider, parsed.provider.default_provider);
        prop_assert_eq!(config.provider.max_retries, parsed.provider.max_retries);
        prop_assert_eq!(config.quality.accept_threshold, parsed.quality.accept_threshold);
        prop_assert_eq!(config.executor.max_concurrent_tasks, parsed.executor.max_concurrent_tasks);
        prop_assert_eq!(config.orchestrator.cycle_interval_secs, parsed.orchestrator.cycle_interval_secs);
    }
}
