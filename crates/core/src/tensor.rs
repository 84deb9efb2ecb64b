use anyhow::{Result, ensure};
use candle_core::{DType, Tensor};

/// Gather token embeddings for a batch of caption ids.
///
/// `weight` must be `[vocab, hidden]` and `ids` must be rank-2 `[batch, seq]`. The returned tensor
/// has shape `[batch, seq, hidden]`.
pub fn gather_token_embeddings(weight: &Tensor, ids: &Tensor) -> Result<Tensor> {
    ensure!(
        ids.rank() == 2,
        "caption ids must have shape [batch, seq], got rank {}",
        ids.rank()
    );
    let (_vocab, hidden) = weight.shape().dims2()?;
    let (batch, seq_len) = ids.shape().dims2()?;
    let ids = match ids.dtype() {
        DType::U32 | DType::I64 => ids.clone(),
        _ => ids.to_dtype(DType::U32)?,
    };
    let flat = ids.reshape((batch * seq_len,))?.contiguous()?;
    let gathered = weight.contiguous()?.index_select(&flat, 0)?;
    Ok(gathered.reshape((batch, seq_len, hidden))?)
}

/// Reorder the leading dimension of `tensor` so that row `i` of the result is row `order[i]`.
pub fn select_rows(tensor: &Tensor, order: &[usize]) -> Result<Tensor> {
    let rows = tensor.dim(0)?;
    ensure!(
        order.iter().all(|&idx| idx < rows),
        "row permutation references index outside 0..{rows}"
    );
    let ids: Vec<u32> = order.iter().map(|&idx| idx as u32).collect();
    let ids = Tensor::from_vec(ids, order.len(), tensor.device())?;
    Ok(tensor.index_select(&ids, 0)?)
}
