use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use captioner_model::DecoderOutput;
use captioner_train::{Adam, AdamParams, caption_loss, clip_gradients};

fn output(logits: Tensor, captions: &[[u32; 4]; 2], alphas: Tensor) -> Result<DecoderOutput> {
    let flat: Vec<u32> = captions.iter().flatten().copied().collect();
    Ok(DecoderOutput {
        logits,
        captions: Tensor::from_vec(flat, (2, 4), &Device::Cpu)?,
        decode_lengths: vec![3, 1],
        alphas,
        sort_order: vec![0, 1],
    })
}

fn scalar(tensor: &Tensor) -> Result<f32> {
    Ok(tensor.to_scalar::<f32>()?)
}

#[test]
fn padded_positions_do_not_affect_the_loss() -> Result<()> {
    let device = Device::Cpu;
    let logits = Tensor::randn(0f32, 1.0, (2, 3, 5), &device)?;
    let alphas = Tensor::zeros((2, 3, 4), DType::F32, &device)?;
    let base = output(logits.clone(), &[[1, 2, 3, 4], [1, 2, 0, 0]], alphas.clone())?;

    // Row 1 only decodes one step: its later logits and targets are never scored.
    let noise = Tensor::randn(0f32, 10.0, (1, 2, 5), &device)?;
    let row1 = Tensor::cat(&[&logits.narrow(0, 1, 1)?.narrow(1, 0, 1)?, &noise], 1)?;
    let mutated_logits = Tensor::cat(&[&logits.narrow(0, 0, 1)?, &row1], 0)?;
    let mutated = output(mutated_logits, &[[1, 2, 3, 4], [1, 2, 4, 4]], alphas)?;

    let a = caption_loss(&base, 1.0)?;
    let b = caption_loss(&mutated, 1.0)?;
    assert_eq!(a.tokens, 4);
    assert!((scalar(&a.cross_entropy)? - scalar(&b.cross_entropy)?).abs() < 1e-6);
    Ok(())
}

#[test]
fn cross_entropy_is_a_uniform_token_mean() -> Result<()> {
    let device = Device::Cpu;
    // Zero logits give log(V) per token regardless of the target.
    let logits = Tensor::zeros((2, 3, 5), DType::F32, &device)?;
    let alphas = Tensor::zeros((2, 3, 4), DType::F32, &device)?;
    let loss = caption_loss(&output(logits, &[[1, 2, 3, 4], [1, 2, 0, 0]], alphas)?, 0.0)?;
    assert!((scalar(&loss.cross_entropy)? - 5f32.ln()).abs() < 1e-5);
    assert!((scalar(&loss.total)? - 5f32.ln()).abs() < 1e-5);
    Ok(())
}

#[test]
fn coverage_penalises_attention_mass_away_from_one() -> Result<()> {
    let device = Device::Cpu;
    let logits = Tensor::zeros((2, 3, 5), DType::F32, &device)?;
    let captions = [[1, 2, 3, 4], [1, 2, 0, 0]];

    let balanced = Tensor::full(1f32 / 3.0, (2, 3, 4), &device)?;
    let loss = caption_loss(&output(logits.clone(), &captions, balanced)?, 0.5)?;
    assert!(scalar(&loss.coverage)?.abs() < 1e-6);

    let empty = Tensor::zeros((2, 3, 4), DType::F32, &device)?;
    let loss = caption_loss(&output(logits, &captions, empty)?, 0.5)?;
    assert!((scalar(&loss.coverage)? - 1.0).abs() < 1e-6);
    let penalty = scalar(&loss.total)? - scalar(&loss.cross_entropy)?;
    assert!((penalty - 0.5).abs() < 1e-6);
    Ok(())
}

#[test]
fn clipping_bounds_present_gradients_and_skips_absent_ones() -> Result<()> {
    let device = Device::Cpu;
    let used = Var::new(&[10f32, -10.0, 0.1], &device)?;
    let unused = Var::new(&[1f32], &device)?;
    let mut grads = used.as_tensor().sqr()?.sum_all()?.backward()?;

    let clipped = clip_gradients(&mut grads, [&used, &unused], 1.0)?;
    assert_eq!(clipped, 1);
    let grad = grads.get(used.as_tensor()).expect("gradient").to_vec1::<f32>()?;
    assert_eq!(grad[0], 1.0);
    assert_eq!(grad[1], -1.0);
    assert!((grad[2] - 0.2).abs() < 1e-6);
    assert!(grads.get(unused.as_tensor()).is_none());
    Ok(())
}

#[test]
fn adam_first_step_moves_by_the_learning_rate() -> Result<()> {
    let device = Device::Cpu;
    let stepped = Var::new(&[1f32], &device)?;
    let idle = Var::new(&[2f32], &device)?;
    let mut adam = Adam::new(
        vec![("w".to_string(), stepped.clone()), ("idle".to_string(), idle.clone())],
        AdamParams::with_lr(0.1),
    )?;
    let grads = stepped.as_tensor().affine(3.0, 0.0)?.sum_all()?.backward()?;
    adam.step(&grads)?;

    assert!((stepped.to_vec1::<f32>()?[0] - 0.9).abs() < 1e-5);
    assert_eq!(idle.to_vec1::<f32>()?[0], 2.0);
    let state = adam.export_state()?;
    assert_eq!(state["w.step"].to_vec1::<u32>()?, vec![1]);
    assert_eq!(state["idle.step"].to_vec1::<u32>()?, vec![0]);
    Ok(())
}

fn quadratic_step(adam: &mut Adam, var: &Var) -> Result<()> {
    let target = Tensor::new(&[0.5f32, -1.5], var.device())?;
    let grads = (var.as_tensor() - &target)?.sqr()?.sum_all()?.backward()?;
    adam.step(&grads)
}

#[test]
fn adam_state_round_trip_reproduces_updates() -> Result<()> {
    let device = Device::Cpu;
    let original = Var::new(&[3f32, 4.0], &device)?;
    let mut first = Adam::new(vec![("p".to_string(), original.clone())], AdamParams::with_lr(0.05))?;
    quadratic_step(&mut first, &original)?;
    quadratic_step(&mut first, &original)?;

    let copy = Var::from_tensor(&original.as_tensor().copy()?)?;
    let mut second = Adam::new(vec![("p".to_string(), copy.clone())], AdamParams::with_lr(0.05))?;
    second.import_state(&first.export_state()?)?;

    quadratic_step(&mut first, &original)?;
    quadratic_step(&mut second, &copy)?;
    assert_eq!(original.to_vec1::<f32>()?, copy.to_vec1::<f32>()?);
    Ok(())
}

#[test]
fn adam_rejects_state_for_other_parameters() -> Result<()> {
    let device = Device::Cpu;
    let a = Var::new(&[1f32], &device)?;
    let b = Var::new(&[1f32], &device)?;
    let first = Adam::new(vec![("a".to_string(), a)], AdamParams::default())?;
    let mut second = Adam::new(vec![("b".to_string(), b)], AdamParams::default())?;
    let err = second
        .import_state(&first.export_state()?)
        .expect_err("mismatched names should fail");
    assert!(err.to_string().contains("b.exp_avg"));
    Ok(())
}
