use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Minutes in a day, used for wrapping offset arithmetic.
const MINUTES_PER_DAY: u32 = 1440;

/// A `[open, close)` trading window expressed as `HHMM` wall-clock times.
///
/// A window whose `close` is numerically below its `open` crosses midnight
/// (eg/ a `2100 -> 0230` night segment).
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
    derive_more::Constructor,
)]
pub struct TimeWindow {
    pub open: u32,
    pub close: u32,
}

/// Trading session template: an optional opening auction plus one or more
/// trading sections (eg/ night, morning, afternoon).
///
/// All arithmetic runs in "offset minutes": wall-clock minutes shifted by
/// `offset` so that a night section sorts before the day sections of the
/// same trading date. `offset` is positive when the session opens the
/// evening before its trading date.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct SessionSpec {
    pub id: SmolStr,
    pub name: SmolStr,
    /// Minutes added to wall-clock time before any comparison.
    #[serde(default)]
    pub offset: i32,
    #[serde(default)]
    pub auction: Option<TimeWindow>,
    pub sections: Vec<TimeWindow>,
}

fn to_minutes(hhmm: u32) -> u32 {
    (hhmm / 100) * 60 + hhmm % 100
}

fn to_hhmm(minutes: u32) -> u32 {
    let minutes = minutes % MINUTES_PER_DAY;
    (minutes / 60) * 100 + minutes % 60
}

impl SessionSpec {
    /// Shift a wall-clock `HHMM` into the session's offset timeline.
    pub fn offset_time(&self, hhmm: u32) -> u32 {
        let shifted = to_minutes(hhmm) as i32 + self.offset;
        to_hhmm(shifted.rem_euclid(MINUTES_PER_DAY as i32) as u32)
    }

    /// Inverse of [`offset_time`](Self::offset_time).
    pub fn original_time(&self, hhmm: u32) -> u32 {
        let shifted = to_minutes(hhmm) as i32 - self.offset;
        to_hhmm(shifted.rem_euclid(MINUTES_PER_DAY as i32) as u32)
    }

    fn offset_window(&self, window: &TimeWindow) -> (u32, u32) {
        let open = to_minutes(self.offset_time(window.open));
        let mut close = to_minutes(self.offset_time(window.close));
        if close <= open {
            close += MINUTES_PER_DAY;
        }
        (open, close)
    }

    /// First trading minute of the session, as wall-clock `HHMM`.
    pub fn open_time(&self) -> u32 {
        self.sections.first().map(|w| w.open).unwrap_or(0)
    }

    /// Last trading minute of the session, as wall-clock `HHMM`.
    pub fn close_time(&self) -> u32 {
        self.sections.last().map(|w| w.close).unwrap_or(0)
    }

    /// Whether the wall-clock `HHMM` falls inside any trading section.
    ///
    /// The closing minute itself counts as inside: bars are labelled by
    /// their close minute, so the `11:30` label of the last morning bar
    /// must resolve to the morning section.
    pub fn is_in_trading(&self, hhmm: u32) -> bool {
        self.section_index(hhmm).is_some()
    }

    /// Index of the section containing `hhmm`, if any.
    pub fn section_index(&self, hhmm: u32) -> Option<usize> {
        let t = to_minutes(self.offset_time(hhmm));
        self.sections.iter().enumerate().find_map(|(idx, window)| {
            let (open, close) = self.offset_window(window);
            // A minute exactly on the open belongs to the section but is
            // not a bar label; bar labels run (open, close].
            (t > open && t <= close || t + MINUTES_PER_DAY > open && t + MINUTES_PER_DAY <= close)
                .then_some(idx)
        })
    }

    /// Trading minutes in section `idx`.
    pub fn section_minutes(&self, idx: usize) -> u32 {
        let Some(window) = self.sections.get(idx) else {
            return 0;
        };
        let (open, close) = self.offset_window(window);
        close - open
    }

    /// Total trading minutes across all sections.
    pub fn total_minutes(&self) -> u32 {
        (0..self.sections.len()).map(|i| self.section_minutes(i)).sum()
    }

    /// Zero-based index of a close-labelled minute bar within its section.
    ///
    /// For a `0930 -> 1130` morning section, the `0931` bar has index 0 and
    /// the `1130` bar has index 119.
    pub fn bar_index_in_section(&self, hhmm: u32) -> Option<(usize, u32)> {
        let idx = self.section_index(hhmm)?;
        let (open, _) = self.offset_window(&self.sections[idx]);
        let mut t = to_minutes(self.offset_time(hhmm));
        if t <= open {
            t += MINUTES_PER_DAY;
        }
        Some((idx, t - open - 1))
    }

    /// Zero-based index of a close-labelled minute bar within the whole
    /// session (sections concatenated).
    pub fn bar_index(&self, hhmm: u32) -> Option<u32> {
        let (section, in_section) = self.bar_index_in_section(hhmm)?;
        let before: u32 = (0..section).map(|i| self.section_minutes(i)).sum();
        Some(before + in_section)
    }

    /// Whether `hhmm` labels the final minute bar of its section.
    pub fn is_section_close(&self, hhmm: u32) -> bool {
        match self.bar_index_in_section(hhmm) {
            Some((idx, in_section)) => in_section + 1 == self.section_minutes(idx),
            None => false,
        }
    }

    /// Wall-clock close label of the `times`-minute bar containing the
    /// 1-minute bar labelled `hhmm`, honouring section boundaries when
    /// `align_by_section` is set.
    ///
    /// An incomplete group at a section end closes at the section close.
    pub fn bar_close_time(&self, hhmm: u32, times: u32, align_by_section: bool) -> Option<u32> {
        let times = times.max(1);
        if align_by_section {
            let (section, in_section) = self.bar_index_in_section(hhmm)?;
            let group_end = ((in_section / times) + 1) * times;
            let capped = group_end.min(self.section_minutes(section));
            let (open, _) = self.offset_window(&self.sections[section]);
            Some(self.original_time(to_hhmm(open + capped)))
        } else {
            let global = self.bar_index(hhmm)?;
            let group_end = ((global / times) + 1) * times;
            let capped = group_end.min(self.total_minutes());
            self.minute_to_close_label(capped)
        }
    }

    /// Wall-clock label of the `n`-th trading minute (1-based close label).
    fn minute_to_close_label(&self, n: u32) -> Option<u32> {
        let mut remaining = n;
        for (idx, window) in self.sections.iter().enumerate() {
            let len = self.section_minutes(idx);
            if remaining <= len {
                let (open, _) = self.offset_window(window);
                return Some(self.original_time(to_hhmm(open + remaining)));
            }
            remaining -= len;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day_session() -> SessionSpec {
        SessionSpec {
            id: SmolStr::new("SD0930"),
            name: SmolStr::new("stock day"),
            offset: 0,
            auction: Some(TimeWindow::new(925, 930)),
            sections: vec![TimeWindow::new(930, 1130), TimeWindow::new(1300, 1500)],
        }
    }

    fn night_session() -> SessionSpec {
        SessionSpec {
            id: SmolStr::new("FN2100"),
            name: SmolStr::new("futures night"),
            offset: 300,
            auction: None,
            sections: vec![
                TimeWindow::new(2100, 230),
                TimeWindow::new(900, 1130),
                TimeWindow::new(1330, 1500),
            ],
        }
    }

    #[test]
    fn test_section_lookup() {
        struct TestCase {
            session: SessionSpec,
            input: u32,
            expected: Option<usize>,
        }

        let tests = vec![
            // TC0: first morning bar label
            TestCase { session: day_session(), input: 931, expected: Some(0) },
            // TC1: morning close label still belongs to the morning
            TestCase { session: day_session(), input: 1130, expected: Some(0) },
            // TC2: lunch break is outside
            TestCase { session: day_session(), input: 1200, expected: None },
            // TC3: afternoon bar
            TestCase { session: day_session(), input: 1400, expected: Some(1) },
            // TC4: night segment before midnight
            TestCase { session: night_session(), input: 2230, expected: Some(0) },
            // TC5: night segment after midnight
            TestCase { session: night_session(), input: 130, expected: Some(0) },
            // TC6: day segment of the night session
            TestCase { session: night_session(), input: 1000, expected: Some(1) },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.session.section_index(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_bar_index() {
        let session = day_session();
        assert_eq!(session.bar_index(931), Some(0));
        assert_eq!(session.bar_index(1130), Some(119));
        assert_eq!(session.bar_index(1301), Some(120));
        assert_eq!(session.bar_index(1500), Some(239));
        assert_eq!(session.total_minutes(), 240);
    }

    #[test]
    fn test_bar_close_time_aligned() {
        struct TestCase {
            input: u32,
            times: u32,
            expected: Option<u32>,
        }

        let session = day_session();
        let tests = vec![
            // TC0: first 15-min group closes at 09:45
            TestCase { input: 931, times: 15, expected: Some(945) },
            TestCase { input: 945, times: 15, expected: Some(945) },
            // TC1: next group starts at 09:46
            TestCase { input: 946, times: 15, expected: Some(1000) },
            // TC2: the group touching the morning close truncates at 11:30
            TestCase { input: 1121, times: 50, expected: Some(1130) },
            // TC3: afternoon restarts its own grouping
            TestCase { input: 1301, times: 15, expected: Some(1315) },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = session.bar_close_time(test.input, test.times, true);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_night_session_ordering() {
        let session = night_session();
        // The night open sorts before the day sections on the offset line.
        assert!(session.offset_time(2101) < session.offset_time(901));
        assert_eq!(session.bar_index(2101), Some(0));
        // 21:00..02:30 is 330 minutes
        assert_eq!(session.section_minutes(0), 330);
        assert_eq!(session.bar_index(901), Some(330));
    }
}
