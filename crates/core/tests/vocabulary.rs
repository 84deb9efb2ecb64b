use anyhow::Result;
use captioner_core::{END_TOKEN, PAD_TOKEN, START_TOKEN, TokenCounter, UNK_TOKEN, Vocabulary};

fn cat_dog_vocab() -> Result<Vocabulary> {
    let captions = vec![vec!["a", "cat"], vec!["a", "dog"], vec!["a", "cat"]];
    Vocabulary::from_captions(&captions, 0)
}

#[test]
fn ids_follow_first_seen_order_with_reserved_tail() -> Result<()> {
    // Counts are a:3, cat:2, dog:1, so a threshold of 0 keeps all three words.
    let vocab = cat_dog_vocab()?;
    assert_eq!(vocab.id("a"), Some(1));
    assert_eq!(vocab.id("cat"), Some(2));
    assert_eq!(vocab.id("dog"), Some(3));
    assert_eq!(vocab.id(UNK_TOKEN), Some(4));
    assert_eq!(vocab.id(START_TOKEN), Some(5));
    assert_eq!(vocab.id(END_TOKEN), Some(6));
    assert_eq!(vocab.id(PAD_TOKEN), Some(0));
    assert_eq!(vocab.len(), 7);
    Ok(())
}

#[test]
fn threshold_is_strictly_greater_than() -> Result<()> {
    let captions = vec![vec!["a", "cat"], vec!["a", "dog"], vec!["a", "cat"]];
    let vocab = Vocabulary::from_captions(&captions, 1)?;
    // dog appears once, which is not strictly above the threshold.
    assert_eq!(vocab.id("a"), Some(1));
    assert_eq!(vocab.id("cat"), Some(2));
    assert_eq!(vocab.id("dog"), None);
    let n = 2;
    for reserved in [UNK_TOKEN, START_TOKEN, END_TOKEN] {
        assert!(vocab.id(reserved).unwrap() > n);
    }
    assert_ne!(vocab.unk_id(), vocab.start_id());
    assert_ne!(vocab.start_id(), vocab.end_id());
    assert_eq!(vocab.pad_id(), 0);
    Ok(())
}

#[test]
fn frequency_filter_property_holds_for_every_word() -> Result<()> {
    let captions = vec![
        vec!["x", "y", "z", "x"],
        vec!["y", "x", "w"],
        vec!["z", "x", "v", "v"],
    ];
    let mut counter = TokenCounter::new();
    for caption in &captions {
        counter.update(caption);
    }
    let min = 1;
    let vocab = Vocabulary::build(&counter, min)?;
    let kept = counter.iter().filter(|(_, count)| *count > min).count() as u32;
    for (word, count) in counter.iter() {
        match vocab.id(word) {
            Some(id) => {
                assert!(count > min, "{word} kept with count {count}");
                assert!((1..=kept).contains(&id));
            }
            None => assert!(count <= min, "{word} dropped with count {count}"),
        }
    }
    Ok(())
}

#[test]
fn empty_corpus_is_rejected() {
    let captions: Vec<Vec<&str>> = Vec::new();
    let err = Vocabulary::from_captions(&captions, 0).expect_err("empty corpus must fail");
    assert!(err.to_string().contains("empty caption corpus"));
}

#[test]
fn build_is_deterministic() -> Result<()> {
    assert_eq!(cat_dog_vocab()?, cat_dog_vocab()?);
    Ok(())
}

#[test]
fn encode_pads_to_max_len_plus_two() -> Result<()> {
    let vocab = cat_dog_vocab()?;
    let encoded = vocab.encode(&["a", "cat"], 5)?;
    assert_eq!(encoded.ids, vec![5, 1, 2, 6, 0, 0, 0]);
    assert_eq!(encoded.length, 4);
    Ok(())
}

#[test]
fn encode_maps_unknown_words_and_rejects_overlong_captions() -> Result<()> {
    let vocab = cat_dog_vocab()?;
    let encoded = vocab.encode(&["a", "zebra"], 3)?;
    assert_eq!(encoded.ids, vec![5, 1, 4, 6, 0]);

    let err = vocab
        .encode(&["a", "cat", "a", "dog"], 3)
        .expect_err("caption longer than max_len must fail");
    assert!(err.to_string().contains("maximum is 3"));
    Ok(())
}

#[test]
fn decode_recovers_known_tokens_and_unknown_sentinel() -> Result<()> {
    let vocab = cat_dog_vocab()?;
    let tokens = ["a", "dog", "sat", "a", "cat"];
    let encoded = vocab.encode(&tokens, 8)?;
    let decoded = vocab.decode(&encoded.ids);
    assert_eq!(decoded, vec!["a", "dog", UNK_TOKEN, "a", "cat"]);
    Ok(())
}

#[test]
fn json_round_trip_preserves_ids() -> Result<()> {
    let vocab = cat_dog_vocab()?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("WORDMAP.json");
    vocab.save(&path)?;

    let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(raw["cat"], 2);
    assert_eq!(raw[PAD_TOKEN], 0);
    assert_eq!(raw[END_TOKEN], 6);

    let restored = Vocabulary::load(&path)?;
    assert_eq!(restored, vocab);
    Ok(())
}

#[test]
fn loading_rejects_sparse_ids() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("WORDMAP.json");
    std::fs::write(
        &path,
        r#"{"a": 1, "<unk>": 2, "<start>": 3, "<end>": 9, "<pad>": 0}"#,
    )?;
    let err = Vocabulary::load(&path).expect_err("sparse ids must be rejected");
    assert!(format!("{err:#}").contains("dense id range"));
    Ok(())
}
