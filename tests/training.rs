//! End-to-end run over a character-level dataset on disk

use nanogpt::data::write_tokens;
use nanogpt::{
    Checkpoint, DatasetMeta, InitFrom, TokenBatch, TrainConfig, Trainer, CHECKPOINT_FILE,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::Path;

const TEXT: &str = "to be or not to be, that is the question. ";

fn write_char_dataset(dir: &Path) -> DatasetMeta {
    let mut chars: Vec<char> = TEXT.chars().collect();
    chars.sort_unstable();
    chars.dedup();
    let stoi: BTreeMap<String, usize> = chars
        .iter()
        .enumerate()
        .map(|(i, c)| (c.to_string(), i))
        .collect();
    let itos: BTreeMap<usize, String> = stoi.iter().map(|(s, &i)| (i, s.clone())).collect();
    let meta = DatasetMeta {
        vocab_size: chars.len(),
        itos: Some(itos),
        stoi: Some(stoi),
    };

    let ids = meta.encode(&TEXT.repeat(40)).unwrap();
    let tokens: Vec<u16> = ids.iter().map(|&i| i as u16).collect();
    let split = tokens.len() * 9 / 10;
    write_tokens(dir.join("train.bin"), &tokens[..split]).unwrap();
    write_tokens(dir.join("val.bin"), &tokens[split..]).unwrap();
    meta.save(dir).unwrap();
    meta
}

#[test]
fn train_checkpoint_resume_and_sample() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let meta = write_char_dataset(data.path());

    let config = TrainConfig {
        data_dir: data.path().to_path_buf(),
        out_dir: out.path().to_path_buf(),
        max_iters: 10,
        ..TrainConfig::tiny()
    };
    let mut trainer = Trainer::new(config.clone()).unwrap();
    assert_eq!(trainer.model.vocab_size(), meta.vocab_size);
    let summary = trainer.train().unwrap();
    assert_eq!(summary.iter_num, 11);

    let ckpt_path = out.path().join(CHECKPOINT_FILE);
    assert!(ckpt_path.exists());
    let ckpt = Checkpoint::load(&ckpt_path).unwrap();
    // saved at the iter 10 evaluation
    assert_eq!(ckpt.iter_num, 10);
    assert_eq!(ckpt.config.data_dir, data.path());

    // resumed weights reproduce the checkpoint's logits exactly
    let mut rng = StdRng::seed_from_u64(0);
    let mut saved = ckpt.into_model(&mut rng).unwrap();
    saved.set_training(false);
    let mut resumed = Trainer::new(TrainConfig {
        init_from: InitFrom::Resume,
        max_iters: 15,
        ..config
    })
    .unwrap();
    assert_eq!(resumed.iter_num, 10);
    resumed.model.set_training(false);

    let prompt = TokenBatch::single(meta.encode("to be").unwrap());
    let (a, _) = saved.forward(&prompt, None, &mut rng).unwrap();
    let (b, _) = resumed.model.forward(&prompt, None, &mut rng).unwrap();
    assert_eq!(a, b);

    resumed.model.set_training(true);
    let summary = resumed.train().unwrap();
    assert_eq!(summary.iter_num, 16);
    assert!(summary.last_loss.unwrap().is_finite());

    // generation stays inside the vocabulary and decodes cleanly
    resumed.model.set_training(false);
    let out = resumed
        .model
        .generate(&prompt, 20, 0.8, Some(5), &mut rng)
        .unwrap();
    assert_eq!(out.row(0).len(), prompt.row(0).len() + 20);
    let text = meta.decode(out.row(0)).unwrap();
    assert!(text.starts_with("to be"));
    assert!(!text.contains('?'));
}
