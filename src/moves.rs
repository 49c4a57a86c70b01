/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Sequentialization of parallel moves between allocated locations.

use crate::target::{Architecture, Register};
use crate::value::{Kind, Value, VirtualStackSlot};
use core::fmt;
use smallvec::{smallvec, SmallVec};

/// Where an allocated value lives. Spill slots are compared by id only;
/// the kind of a move travels alongside it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Location {
    Reg(Register),
    Stack(u32),
}

impl Location {
    pub fn from_value(value: &Value) -> Option<Location> {
        match value {
            Value::Register(r) => Some(Location::Reg(r.reg)),
            Value::VirtualStackSlot(s) => Some(Location::Stack(s.id)),
            _ => None,
        }
    }

    pub fn to_value(self, kind: Kind, arch: &Architecture) -> Value {
        match self {
            Location::Reg(reg) => Value::Register(arch.register_value(reg, kind)),
            Location::Stack(id) => Value::VirtualStackSlot(VirtualStackSlot { id, kind }),
        }
    }

    pub fn is_stack(self) -> bool {
        matches!(self, Location::Stack(_))
    }

    pub fn as_reg(self) -> Option<Register> {
        match self {
            Location::Reg(reg) => Some(reg),
            Location::Stack(_) => None,
        }
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Location::Reg(reg) => write!(f, "{}", reg),
            Location::Stack(id) => write!(f, "slot{}", id),
        }
    }
}

/// A list of moves to be performed in sequence, with auxiliary data
/// attached to each.
pub type MoveVec<T> = SmallVec<[(Location, Location, T); 16]>;

/// Moves where `None` stands for a scratch location not yet chosen.
type ScratchMoveVec<T> = SmallVec<[(Option<Location>, Option<Location>, T); 16]>;

/// A list of sequential moves that may still refer to an unchosen
/// scratch location.
#[derive(Clone, Debug)]
pub enum MoveVecWithScratch<T> {
    /// No scratch was actually used.
    NoScratch(MoveVec<T>),
    /// A scratch space was used.
    Scratch(ScratchMoveVec<T>),
}

/// A `ParallelMoves` represents a list of moves that must happen in
/// parallel: all reads of sources semantically happen before all
/// writes of destinations, and destinations may overwrite sources. It
/// computes an equivalent list of sequential moves, using a scratch
/// location when the moves form a cycle.
pub struct ParallelMoves<T: Clone + Copy + fmt::Debug> {
    parallel_moves: MoveVec<T>,
}

impl<T: Clone + Copy + fmt::Debug + PartialEq> ParallelMoves<T> {
    pub fn new() -> Self {
        Self {
            parallel_moves: smallvec![],
        }
    }

    pub fn add(&mut self, from: Location, to: Location, t: T) {
        self.parallel_moves.push((from, to, t));
    }

    pub fn is_empty(&self) -> bool {
        self.parallel_moves.is_empty()
    }

    fn sources_overlap_dests(&self) -> bool {
        // Assumes `parallel_moves` is sorted by source.
        self.parallel_moves.iter().any(|&(_, dst, _)| {
            self.parallel_moves
                .binary_search_by_key(&dst, |&(src, _, _)| src)
                .is_ok()
        })
    }

    /// Resolves the parallel moves to a sequence whose combined effect
    /// equals performing them all at once. Self-moves are dropped.
    ///
    /// Each destination must have exactly one writer. Every move then
    /// blocks at most one other move, so the dependency graph only has
    /// simple cycles and each cycle can be emitted as soon as it is
    /// found, through the scratch location.
    pub fn resolve(mut self) -> MoveVecWithScratch<T> {
        self.parallel_moves.retain(|&mut (src, dst, _)| src != dst);
        if self.parallel_moves.len() <= 1 {
            return MoveVecWithScratch::NoScratch(self.parallel_moves);
        }

        self.parallel_moves.sort_by_key(|&(src, dst, _)| (src, dst));
        if !self.sources_overlap_dests() {
            return MoveVecWithScratch::NoScratch(self.parallel_moves);
        }

        // Sort by destination so the move overwriting a given location
        // can be found by binary search.
        self.parallel_moves.sort_by_key(|&(_, dst, _)| dst);
        self.parallel_moves.dedup();
        debug_assert!(
            self.parallel_moves.windows(2).all(|w| w[0].1 != w[1].1),
            "location written twice in one parallel move: {:?}",
            self.parallel_moves
        );

        // A move must come before the move that overwrites its source.
        let mut must_come_before: SmallVec<[Option<usize>; 16]> =
            smallvec![None; self.parallel_moves.len()];
        for (i, &(src, _, _)) in self.parallel_moves.iter().enumerate() {
            if let Ok(move_to_dst_idx) = self
                .parallel_moves
                .binary_search_by_key(&src, |&(_, dst, _)| dst)
            {
                must_come_before[i] = Some(move_to_dst_idx);
            }
        }

        // Stack-based DFS emitting moves in postorder; reversed at the
        // end.
        let mut ret: ScratchMoveVec<T> = smallvec![];
        let mut stack: SmallVec<[usize; 16]> = smallvec![];
        let mut visited: SmallVec<[bool; 16]> = smallvec![false; self.parallel_moves.len()];
        let mut onstack: SmallVec<[bool; 16]> = smallvec![false; self.parallel_moves.len()];
        let mut scratch_used = false;

        let lift = |(src, dst, t): (Location, Location, T)| (Some(src), Some(dst), t);

        stack.push(0);
        onstack[0] = true;
        loop {
            let top = match stack.last() {
                Some(&top) => top,
                None => match visited.iter().position(|&flag| !flag) {
                    Some(next) => {
                        stack.push(next);
                        onstack[next] = true;
                        next
                    }
                    None => break,
                },
            };

            visited[top] = true;
            match must_come_before[top] {
                Some(next) if !visited[next] && !onstack[next] => {
                    stack.push(next);
                    onstack[next] = true;
                }
                Some(next) if onstack[next] => {
                    // Found a cycle. From `{ B := A, C := B, A := C }`
                    // emit (before reversal)
                    //
                    //     A := scratch
                    //     B := A
                    //     C := B
                    //     scratch := C
                    let mut last_dst = None;
                    let mut scratch_src = None;
                    while let Some(move_idx) = stack.pop() {
                        onstack[move_idx] = false;
                        let (src, dst, t) = self.parallel_moves[move_idx];
                        let src = match last_dst {
                            None => {
                                scratch_src = Some((src, t));
                                scratch_used = true;
                                None
                            }
                            Some(last) => {
                                debug_assert_eq!(last, src);
                                Some(src)
                            }
                        };
                        ret.push((src, Some(dst), t));
                        last_dst = Some(dst);
                        if move_idx == next {
                            break;
                        }
                    }
                    if let Some((src, t)) = scratch_src {
                        ret.push((Some(src), None, t));
                    }
                }
                _ => {
                    // No unvisited dependency: emit this move and
                    // everything waiting on it.
                    while let Some(top) = stack.pop() {
                        ret.push(lift(self.parallel_moves[top]));
                        onstack[top] = false;
                    }
                }
            }
        }

        ret.reverse();

        if scratch_used {
            MoveVecWithScratch::Scratch(ret)
        } else {
            MoveVecWithScratch::NoScratch(
                ret.into_iter()
                    .filter_map(|(src, dst, t)| Some((src?, dst?, t)))
                    .collect(),
            )
        }
    }
}

impl<T: Copy> MoveVecWithScratch<T> {
    /// Fills in the scratch location, if needed, and returns the final
    /// list of moves. The scratch location must not occur anywhere in
    /// the parallel-move problem.
    pub fn with_scratch(self, scratch: Location) -> MoveVec<T> {
        match self {
            MoveVecWithScratch::NoScratch(moves) => moves,
            MoveVecWithScratch::Scratch(moves) => moves
                .into_iter()
                .map(|(src, dst, t)| {
                    debug_assert!(
                        src != Some(scratch) && dst != Some(scratch),
                        "scratch location should not also be an actual source or dest of moves"
                    );
                    debug_assert!(
                        src.is_some() || dst.is_some(),
                        "move resolution should not have produced a scratch-to-scratch move"
                    );
                    (src.unwrap_or(scratch), dst.unwrap_or(scratch), t)
                })
                .collect(),
        }
    }

    /// Do we need a scratch location?
    pub fn needs_scratch(&self) -> bool {
        matches!(self, MoveVecWithScratch::Scratch(..))
    }
}
