//! Frame placement policies for the core map.

use super::{AllocError, CoreMapEntry};
use core::ops::Range;

/// A placement algorithm for allocating frames.
pub trait PlacementAlgorithm: Default + Send {
    /// Returns [`Ok`] containing the range of frame numbers to allocate.
    ///
    /// # Errors
    ///
    /// If no run of `frames_requested` free frames exists.
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Result<Range<usize>, AllocError>;
}

/// Length of the free run starting at `start`, capped at `limit`.
fn free_run(core_map: &[CoreMapEntry], start: usize, limit: usize) -> usize {
    core_map[start..]
        .iter()
        .take(limit)
        .take_while(|entry| !entry.allocated())
        .count()
}

/// Scan `[from, to)` for the first run of `wanted` free frames.
fn first_run(core_map: &[CoreMapEntry], from: usize, to: usize, wanted: usize) -> Option<usize> {
    let mut start = from;
    while start + wanted <= to {
        let run = free_run(core_map, start, wanted);
        if run == wanted {
            return Some(start);
        }
        // Skip past the allocated frame that ended the run.
        start += run + 1;
    }
    None
}

/// Resume searching where the previous allocation ended, wrapping once.
#[derive(Default)]
pub struct NextFit {
    position: usize,
}

/// Always search from frame zero.
#[derive(Default)]
pub struct FirstFit;

impl PlacementAlgorithm for NextFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Result<Range<usize>, AllocError> {
        let total_frames = core_map.len();
        if frames_requested == 0 || frames_requested > total_frames {
            return Err(AllocError);
        }
        let position = self.position.min(total_frames);

        // A run may straddle `position`, so the wrapped pass scans up to
        // position + frames_requested - 1.
        let start = first_run(core_map, position, total_frames, frames_requested)
            .or_else(|| {
                let end = (position + frames_requested - 1).min(total_frames);
                first_run(core_map, 0, end, frames_requested)
            })
            .ok_or(AllocError)?;

        self.position = (start + frames_requested) % total_frames;
        Ok(start..start + frames_requested)
    }
}

impl PlacementAlgorithm for FirstFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Result<Range<usize>, AllocError> {
        if frames_requested == 0 {
            return Err(AllocError);
        }
        first_run(core_map, 0, core_map.len(), frames_requested)
            .map(|start| start..start + frames_requested)
            .ok_or(AllocError)
    }
}
