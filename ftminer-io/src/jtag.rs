use std::{
    collections::VecDeque,
    fmt::Display,
    ops::{Index, IndexMut},
    sync::LazyLock,
};

use strum::VariantArray;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::VariantArray)]
#[repr(u8)]
pub enum State {
    TestLogicReset,
    RunTestIdle,
    SelectDR,
    CaptureDR,
    ShiftDR,
    Exit1DR,
    PauseDR,
    Exit2DR,
    UpdateDR,
    SelectIR,
    CaptureIR,
    ShiftIR,
    Exit1IR,
    PauseIR,
    Exit2IR,
    UpdateIR,
}

pub struct Edges([State; 2]);
impl State {
    pub const fn edges(self) -> Edges {
        match self {
            State::TestLogicReset => Edges([State::RunTestIdle, State::TestLogicReset]),
            State::RunTestIdle => Edges([State::RunTestIdle, State::SelectDR]),
            State::SelectDR => Edges([State::CaptureDR, State::SelectIR]),
            State::CaptureDR => Edges([State::ShiftDR, State::Exit1DR]),
            State::ShiftDR => Edges([State::ShiftDR, State::Exit1DR]),
            State::Exit1DR => Edges([State::PauseDR, State::UpdateDR]),
            State::PauseDR => Edges([State::PauseDR, State::Exit2DR]),
            State::Exit2DR => Edges([State::ShiftDR, State::UpdateDR]),
            State::UpdateDR => Edges([State::RunTestIdle, State::SelectDR]),
            State::SelectIR => Edges([State::CaptureIR, State::TestLogicReset]),
            State::CaptureIR => Edges([State::ShiftIR, State::Exit1IR]),
            State::ShiftIR => Edges([State::ShiftIR, State::Exit1IR]),
            State::Exit1IR => Edges([State::PauseIR, State::UpdateIR]),
            State::PauseIR => Edges([State::PauseIR, State::Exit2IR]),
            State::Exit2IR => Edges([State::ShiftIR, State::UpdateIR]),
            State::UpdateIR => Edges([State::RunTestIdle, State::SelectDR]),
        }
    }

    /// The state after one TCK with the given TMS level.
    pub fn next(self, tms: bool) -> State {
        GRAPH[self][tms]
    }
}

impl TryFrom<u8> for State {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        State::VARIANTS
            .get(usize::from(value))
            .copied()
            .ok_or(Error::InvalidState(value))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Path {
    path: u8,
    pub len: u8,
}

impl Path {
    /// Transition to TLR, from any state
    pub const RESET: Self = Self { path: 0x1f, len: 5 };
    /// Stay where we are
    pub const EMPTY: Self = Self { path: 0, len: 0 };
}

pub struct Graph<T>(pub [T; State::VARIANTS.len()]);
pub const GRAPH: Graph<Edges> = Graph([
    State::TestLogicReset.edges(),
    State::RunTestIdle.edges(),
    State::SelectDR.edges(),
    State::CaptureDR.edges(),
    State::ShiftDR.edges(),
    State::Exit1DR.edges(),
    State::PauseDR.edges(),
    State::Exit2DR.edges(),
    State::UpdateDR.edges(),
    State::SelectIR.edges(),
    State::CaptureIR.edges(),
    State::ShiftIR.edges(),
    State::Exit1IR.edges(),
    State::PauseIR.edges(),
    State::Exit2IR.edges(),
    State::UpdateIR.edges(),
]);

/// Shortest TMS sequence between every pair of states. The diagonal is empty.
pub static PATHS: LazyLock<Graph<Graph<Path>>> = LazyLock::new(|| {
    let mut ret =
        Graph([const { Graph([Path::EMPTY; State::VARIANTS.len()]) }; State::VARIANTS.len()]);
    for start in State::VARIANTS {
        for end in State::VARIANTS {
            if start != end {
                ret[*start][*end] = get_path(*start, *end).unwrap_or(Path::EMPTY);
            }
        }
    }
    ret
});

/// Looks up the TMS sequence from `from` to `to`.
pub fn path(from: State, to: State) -> Result<Path> {
    let path = PATHS[from][to];
    if path.len == 0 && from != to {
        return Err(Error::StateTransition { from, to });
    }
    Ok(path)
}

impl<T> Index<State> for Graph<T> {
    type Output = T;
    fn index(&self, index: State) -> &Self::Output {
        self.0.index(index as u8 as usize)
    }
}

impl<T> IndexMut<State> for Graph<T> {
    fn index_mut(&mut self, index: State) -> &mut Self::Output {
        self.0.index_mut(index as u8 as usize)
    }
}

impl Index<bool> for Edges {
    type Output = State;
    fn index(&self, index: bool) -> &Self::Output {
        self.0.index(index as u8 as usize)
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use std::fmt::Write as _;
        for bit in *self {
            f.write_char(if bit { '1' } else { '0' })?;
        }
        Ok(())
    }
}

/// Breadth-first search over the edge table. Paths longer than 8 clocks do
/// not fit a [`Path`]; none exist in a well-formed graph.
fn get_path(start: State, end: State) -> Option<Path> {
    let mut possible_paths = VecDeque::from([
        (Path { path: 0, len: 1 }, GRAPH[start][false]),
        (Path { path: 1, len: 1 }, GRAPH[start][true]),
    ]);

    while let Some((cur_path, cur_end)) = possible_paths.pop_front() {
        if cur_end == end {
            return Some(cur_path);
        }
        if cur_path.len == 8 {
            continue;
        }

        let p0 = Path {
            path: cur_path.path << 1,
            len: cur_path.len + 1,
        };
        let p1 = Path {
            path: (cur_path.path << 1) | 1,
            len: cur_path.len + 1,
        };
        possible_paths.push_back((p0, GRAPH[cur_end][false]));
        possible_paths.push_back((p1, GRAPH[cur_end][true]));
    }
    None
}

impl IntoIterator for Path {
    type Item = bool;
    type IntoIter = PathIter;
    fn into_iter(self) -> Self::IntoIter {
        PathIter(self, 0)
    }
}

pub struct PathIter(Path, u8);
impl Iterator for PathIter {
    type Item = bool;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.1;
        self.1 = self.1.saturating_add(1);
        if idx < self.0.len {
            Some(self.0.path >> (self.0.len - idx - 1) & 1 == 1)
        } else {
            None
        }
    }
}

/// Sink for clock edges. The state tracker only decides levels; whoever
/// implements this turns them into wire bytes.
pub trait Clock {
    /// Emit one TCK pulse with the given TMS and TDI levels.
    fn clock(&mut self, tms: bool, tdi: bool);
}

/// Tracks the TAP controller shared by every device on one chain.
///
/// The state is `None` until the first reset, and again after any failed
/// transaction, since the hardware may have been left anywhere.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tap {
    state: Option<State>,
}

impl Tap {
    pub const fn new() -> Self {
        Self { state: None }
    }

    pub const fn state(&self) -> Option<State> {
        self.state
    }

    pub fn forget(&mut self) {
        self.state = None;
    }

    /// Record one TCK with the given TMS level. Unknown stays unknown.
    pub fn clock(&mut self, tms: bool) {
        if let Some(state) = self.state {
            self.state = Some(state.next(tms));
        }
    }

    /// Emit one clock and track it.
    pub fn step(&mut self, out: &mut impl Clock, tms: bool, tdi: bool) {
        out.clock(tms, tdi);
        self.clock(tms);
    }

    /// Five TMS-high clocks reach Test-Logic-Reset from any state.
    pub fn reset(&mut self, out: &mut impl Clock) {
        for tms in Path::RESET {
            out.clock(tms, false);
        }
        self.state = Some(State::TestLogicReset);
    }

    /// Walk to `target` along the shortest legal path, resetting first if
    /// the current state is unknown.
    pub fn goto(&mut self, out: &mut impl Clock, target: State) -> Result<()> {
        let current = match self.state {
            Some(state) => state,
            None => {
                self.reset(out);
                State::TestLogicReset
            }
        };
        for tms in path(current, target)? {
            self.step(out, tms, false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use strum::VariantArray;

    use super::*;

    fn follow_path(start: State, path: Path) -> State {
        let mut cur = start;
        for dir in path {
            cur = GRAPH[cur][dir];
        }
        cur
    }

    #[derive(Default)]
    struct Recorder(Vec<bool>);
    impl Clock for Recorder {
        fn clock(&mut self, tms: bool, _tdi: bool) {
            self.0.push(tms);
        }
    }

    #[test]
    fn test_path() {
        for start in State::VARIANTS {
            for end in State::VARIANTS {
                let path = PATHS[*start][*end];
                let result = follow_path(*start, path);
                assert!(
                    *end == result,
                    "
goal:   {start:?} -> {end:?}
path:   {path}
result: {result:?}",
                );
            }
        }
    }

    #[test]
    fn goto_uses_legal_edges() {
        for start in State::VARIANTS {
            for end in State::VARIANTS {
                let mut out = Recorder::default();
                let mut tap = Tap { state: Some(*start) };
                tap.goto(&mut out, *end).unwrap();
                assert_eq!(tap.state(), Some(*end));

                let mut cur = *start;
                for tms in &out.0 {
                    cur = cur.next(*tms);
                }
                assert_eq!(cur, *end, "{start:?} -> {end:?}");
            }
        }
    }

    #[test]
    fn reset_from_anywhere() {
        let starts = State::VARIANTS.iter().copied().map(Some).chain([None]);
        for start in starts {
            let mut out = Recorder::default();
            let mut tap = Tap { state: start };
            tap.reset(&mut out);
            assert_eq!(out.0, [true; 5]);
            assert_eq!(tap.state(), Some(State::TestLogicReset));

            // the hardware agrees, wherever it started
            if let Some(mut hw) = start {
                for tms in &out.0 {
                    hw = hw.next(*tms);
                }
                assert_eq!(hw, State::TestLogicReset);
            }

            tap.reset(&mut out);
            assert_eq!(tap.state(), Some(State::TestLogicReset));
        }
    }

    #[test]
    fn unknown_state_resets_first() {
        let mut out = Recorder::default();
        let mut tap = Tap::new();
        tap.goto(&mut out, State::ShiftIR).unwrap();
        assert_eq!(tap.state(), Some(State::ShiftIR));
        assert_eq!(out.0[..5], [true; 5]);
        assert_eq!(out.0[5..], [false, true, true, false, false]);
    }

    #[test]
    fn unknown_state_ignores_clocks() {
        let mut tap = Tap::new();
        tap.clock(true);
        assert_eq!(tap.state(), None);
    }

    #[test]
    fn same_state_is_empty() {
        assert_eq!(path(State::ShiftDR, State::ShiftDR).unwrap(), Path::EMPTY);
        assert_eq!(PATHS[State::Exit1IR][State::Exit1IR].len, 0);
    }

    #[test]
    fn state_from_raw() {
        assert_eq!(State::try_from(4).unwrap(), State::ShiftDR);
        assert!(matches!(State::try_from(16), Err(Error::InvalidState(16))));
    }
}
