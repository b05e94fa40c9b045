//! Detection of passes interrupted before their commit point.

use crate::core::types::IterationResult;

/// True if `record` shows a pass that never finished cleanly.
///
/// A record is dangling when it has no exit signal (the provisional record was
/// never finalized) or when it reports a nonzero return code even though its
/// gates had already passed.
pub fn is_dangling(record: &IterationResult) -> bool {
    if record.exit_signal.is_none() {
        return true;
    }
    record.gates_passed && record.return_code.is_some_and(|code| code != 0)
}

/// Indices of dangling history entries, in order.
///
/// Parallel workers append provisional records concurrently, so a killed
/// worker's record can sit anywhere in history, not just at the end.
pub fn find_interrupted(history: &[IterationResult]) -> Vec<usize> {
    history
        .iter()
        .enumerate()
        .filter(|(_, record)| is_dangling(record))
        .map(|(idx, _)| idx)
        .collect()
}
