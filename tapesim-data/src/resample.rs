use itertools::Itertools;
use tapesim_instrument::session::SessionSpec;

use crate::model::{
    Bar, Period,
    time::{bar_minute, encode_bar_time},
};

/// Aggregate one group of consecutive base bars into a target bar labelled
/// `time`/`date`.
fn aggregate(group: &[Bar], date: u32, time: u64) -> Bar {
    let first = &group[0];
    let last = &group[group.len() - 1];
    Bar {
        date,
        time,
        open: first.open,
        high: group.iter().map(|b| b.high).fold(f64::MIN, f64::max),
        low: group.iter().map(|b| b.low).fold(f64::MAX, f64::min),
        close: last.close,
        volume: group.iter().map(|b| b.volume).sum(),
        turnover: group.iter().map(|b| b.turnover).sum(),
        open_interest: last.open_interest,
        add_interest: group.iter().map(|b| b.add_interest).sum(),
        bid: last.bid,
        ask: last.ask,
    }
}

/// Resample base-period bars into `times`-multiples.
///
/// Minute groups are bounded by the session's target windows; with
/// `align_by_section` a group never crosses a session-section boundary and
/// an incomplete group at a section end closes early, labelled at the
/// section close. `times == 1` passes the input through untouched.
pub fn resample_bars(
    base: &[Bar],
    period: Period,
    times: u32,
    session: &SessionSpec,
    align_by_section: bool,
) -> Vec<Bar> {
    if times <= 1 || base.is_empty() {
        return base.to_vec();
    }

    if period.is_day() {
        return base
            .chunks(times as usize)
            .map(|group| aggregate(group, group[group.len() - 1].date, 0))
            .collect();
    }

    let step = period.minutes().max(1) * times;
    let groups = base.iter().chunk_by(|bar| {
        session
            .bar_close_time(bar_minute(bar.time), step, align_by_section)
            .unwrap_or(bar_minute(bar.time))
    });
    groups
        .into_iter()
        .map(|(close_label, group)| {
            let group: Vec<Bar> = group.copied().collect();
            let last_date = group[group.len() - 1].date;
            aggregate(&group, last_date, encode_bar_time(last_date, close_label))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol_str::SmolStr;
    use tapesim_instrument::session::TimeWindow;

    fn session() -> SessionSpec {
        SessionSpec {
            id: SmolStr::new("SD0930"),
            name: SmolStr::new("stock day"),
            offset: 0,
            auction: None,
            sections: vec![TimeWindow::new(930, 1130), TimeWindow::new(1300, 1500)],
        }
    }

    fn minute_bars(date: u32, labels: impl IntoIterator<Item = u32>) -> Vec<Bar> {
        labels
            .into_iter()
            .enumerate()
            .map(|(i, hhmm)| Bar {
                date,
                time: encode_bar_time(date, hhmm),
                open: 100.0 + i as f64,
                high: 101.0 + i as f64,
                low: 99.0 + i as f64,
                close: 100.5 + i as f64,
                volume: 10.0,
                turnover: 1000.0,
                open_interest: 50.0 + i as f64,
                add_interest: 1.0,
                ..Bar::default()
            })
            .collect()
    }

    fn morning_labels() -> Vec<u32> {
        // 09:31 .. 11:30 inclusive, 120 labels
        let mut labels = Vec::new();
        let mut hh = 9;
        let mut mm = 31;
        for _ in 0..120 {
            labels.push(hh * 100 + mm);
            mm += 1;
            if mm == 60 {
                mm = 0;
                hh += 1;
            }
        }
        labels
    }

    #[test]
    fn test_identity_at_times_one() {
        let bars = minute_bars(20240105, [931, 932, 933]);
        let out = resample_bars(&bars, Period::Min1, 1, &session(), true);
        assert_eq!(out, bars);
    }

    #[test]
    fn test_fifteen_minute_alignment() {
        let bars = minute_bars(20240105, morning_labels());
        let out = resample_bars(&bars, Period::Min1, 15, &session(), true);

        // 120 morning minutes resample into exactly 8 bars of 15
        assert_eq!(out.len(), 8);
        assert_eq!(bar_minute(out[0].time), 945);
        assert_eq!(bar_minute(out[7].time), 1130);
        // First group aggregates bars 09:31..09:45
        assert_eq!(out[0].open, 100.0);
        assert_eq!(out[0].close, 100.5 + 14.0);
        assert_eq!(out[0].high, 101.0 + 14.0);
        assert_eq!(out[0].low, 99.0);
        assert_eq!(out[0].volume, 150.0);
        assert_eq!(out[0].open_interest, 50.0 + 14.0);
    }

    #[test]
    fn test_truncation_at_section_close() {
        // Only 09:31..11:30 exists; a 50-minute step leaves the last group
        // with 20 bars, which must close at 11:30 and not merge into the
        // afternoon.
        let bars = minute_bars(20240105, morning_labels());
        let out = resample_bars(&bars, Period::Min1, 50, &session(), true);

        assert_eq!(out.len(), 3);
        assert_eq!(bar_minute(out[2].time), 1130);
        assert_eq!(out[2].volume, 200.0);
    }

    #[test]
    fn test_daily_grouping() {
        let bars: Vec<Bar> = (0..5)
            .map(|i| Bar {
                date: 20240101 + i,
                close: 10.0 + i as f64,
                volume: 1.0,
                ..Bar::default()
            })
            .collect();
        let out = resample_bars(&bars, Period::Day, 2, &session(), false);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].date, 20240102);
        assert_eq!(out[2].date, 20240105);
        assert_eq!(out[2].volume, 1.0);
    }
}
