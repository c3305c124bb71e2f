//! Merge engine: append genuinely new export rows to the ledger

use crate::ledger::Ledger;
use crate::row::Row;
use std::collections::{HashMap, HashSet};

/// Result of merging an export batch into a ledger
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// Existing rows followed by the additions
    pub ledger: Ledger,
    /// Number of rows appended
    pub added: usize,
    /// Incoming rows that were already present (in the ledger or earlier in the batch)
    pub duplicates: usize,
}

impl MergeResult {
    /// True when nothing was appended
    pub fn is_noop(&self) -> bool {
        self.added == 0
    }

    /// The appended rows, in export order
    pub fn additions(&self) -> &[Row] {
        let rows = self.ledger.rows();
        &rows[rows.len() - self.added..]
    }
}

/// Rows of `incoming` not present in `existing`, in encounter order.
///
/// A row repeated within `incoming` is returned once.
pub fn find_additions(existing: &[Row], incoming: &[Row]) -> Vec<Row> {
    let mut seen: HashSet<&Row> = existing.iter().collect();
    let mut additions = Vec::new();

    for row in incoming {
        if seen.insert(row) {
            additions.push(row.clone());
        }
    }

    additions
}

/// Merge incoming rows into a ledger.
///
/// Existing rows keep their order and content; new rows are appended in the
/// order they appear in `incoming`.
pub fn merge(mut ledger: Ledger, incoming: &[Row]) -> MergeResult {
    let additions = find_additions(ledger.rows(), incoming);
    let added = additions.len();
    let duplicates = incoming.len() - added;

    ledger.append(additions);

    if added > 0 {
        log::info!("merged {} new transactions ({} already present)", added, duplicates);
    } else {
        log::info!("no new transactions ({} already present)", duplicates);
    }

    MergeResult {
        ledger,
        added,
        duplicates,
    }
}

/// Pairs of (first index, duplicate index) for rows that occur more than once.
///
/// Full-tuple identity cannot tell two genuinely distinct but identical
/// transactions apart; this only reports them.
pub fn find_duplicates(rows: &[Row]) -> Vec<(usize, usize)> {
    let mut first_seen: HashMap<&Row, usize> = HashMap::new();
    let mut duplicates = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        match first_seen.get(row) {
            Some(&first) => duplicates.push((first, index)),
            None => {
                first_seen.insert(row, index);
            }
        }
    }

    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LineEnding;

    fn header() -> Row {
        Row::new(["Data", "Tipo", "Valore"])
    }

    fn row(date: &str, value: &str) -> Row {
        Row::new([date, "Buy", value])
    }

    fn ledger(rows: Vec<Row>) -> Ledger {
        Ledger::with_rows(header(), rows, LineEnding::Crlf)
    }

    #[test]
    fn test_merge_appends_new_rows_and_is_idempotent() {
        let a = row("2024-01-01", "-1");
        let b = row("2024-01-02", "-2");
        let c = row("2024-01-03", "-3");

        let batch = vec![a.clone(), c.clone()];
        let first = merge(ledger(vec![a.clone(), b.clone()]), &batch);

        assert_eq!(first.added, 1);
        assert_eq!(first.duplicates, 1);
        assert_eq!(first.ledger.rows(), &[a.clone(), b.clone(), c.clone()]);
        assert_eq!(first.additions(), &[c.clone()]);

        let second = merge(first.ledger, &batch);
        assert!(second.is_noop());
        assert_eq!(second.ledger.rows(), &[a, b, c]);
    }

    #[test]
    fn test_merge_into_empty_collapses_batch_duplicates() {
        let x = row("2024-02-01", "-10");
        let y = row("2024-02-02", "-20");

        let result = merge(ledger(Vec::new()), &[x.clone(), y.clone(), x.clone()]);

        assert_eq!(result.added, 2);
        assert_eq!(result.duplicates, 1);
        assert_eq!(result.ledger.rows(), &[x, y]);
    }

    #[test]
    fn test_new_rows_keep_export_order() {
        let old = row("2024-01-05", "-5");
        // Deliberately not sorted by date
        let later = row("2024-03-01", "-30");
        let earlier = row("2024-02-01", "-20");

        let result = merge(ledger(vec![old.clone()]), &[later.clone(), earlier.clone()]);

        assert_eq!(result.ledger.rows(), &[old, later, earlier]);
    }

    #[test]
    fn test_existing_prefix_is_untouched() {
        let existing: Vec<Row> = (1..=5).map(|i| row(&format!("2024-01-0{}", i), "-1")).collect();
        let incoming = vec![row("2024-01-09", "-9"), existing[2].clone(), row("2024-01-08", "-8")];

        let result = merge(ledger(existing.clone()), &incoming);

        assert_eq!(&result.ledger.rows()[..existing.len()], existing.as_slice());
        assert_eq!(result.added, 2);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let a = row("2024-01-01", "-1");
        let result = merge(ledger(vec![a.clone()]), &[]);

        assert!(result.is_noop());
        assert_eq!(result.duplicates, 0);
        assert_eq!(result.ledger.rows(), &[a]);
    }

    #[test]
    fn test_batch_fully_duplicate_is_noop() {
        let a = row("2024-01-01", "-1");
        let b = row("2024-01-02", "-2");

        let result = merge(ledger(vec![a.clone(), b.clone()]), &[b, a]);

        assert!(result.is_noop());
        assert_eq!(result.duplicates, 2);
    }

    #[test]
    fn test_single_character_difference_is_new_row() {
        let a = row("2024-01-01", "-1,00");
        let a_spaced = row("2024-01-01", "-1,00 ");

        let result = merge(ledger(vec![a]), &[a_spaced.clone()]);

        assert_eq!(result.additions(), &[a_spaced]);
    }

    #[test]
    fn test_identical_distinct_trades_collapse() {
        // Two genuinely separate but field-identical trades in one export are
        // indistinguishable under full-tuple identity and are kept once.
        let trade = row("2024-04-02", "-100,00");
        let result = merge(ledger(Vec::new()), &[trade.clone(), trade.clone()]);

        assert_eq!(result.added, 1);
    }

    #[test]
    fn test_find_duplicates() {
        let a = row("2024-01-01", "-1");
        let b = row("2024-01-02", "-2");

        let dups = find_duplicates(&[a.clone(), b.clone(), a.clone(), a]);
        assert_eq!(dups, vec![(0, 2), (0, 3)]);
        assert!(find_duplicates(&[b]).is_empty());
    }

    // Properties over random ledgers and batches.
    // 256 cases by default; override with PROPTEST_CASES.

    use proptest::prelude::*;

    fn config_256() -> ProptestConfig {
        ProptestConfig {
            cases: std::env::var("PROPTEST_CASES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(256),
            failure_persistence: None,
            ..ProptestConfig::default()
        }
    }

    /// Rows from a small pool so ledgers and batches overlap often
    fn arb_row() -> impl Strategy<Value = Row> {
        (
            1u8..=6,
            prop_oneof![Just("Buy"), Just("Sell"), Just("Dividend")],
            0u8..3,
        )
            .prop_map(|(day, kind, value)| {
                Row::new([
                    format!("2024-01-0{}", day),
                    kind.to_string(),
                    format!("-{},00", value),
                ])
            })
    }

    /// Ledger rows without duplicates
    fn arb_ledger_rows() -> impl Strategy<Value = Vec<Row>> {
        prop::collection::vec(arb_row(), 0..12).prop_map(|rows| find_additions(&[], &rows))
    }

    fn arb_batch() -> impl Strategy<Value = Vec<Row>> {
        prop::collection::vec(arb_row(), 0..16)
    }

    proptest! {
        #![proptest_config(config_256())]

        #[test]
        fn test_merge_twice_adds_nothing(existing in arb_ledger_rows(), batch in arb_batch()) {
            let once = merge(ledger(existing), &batch);
            let twice = merge(once.ledger.clone(), &batch);

            prop_assert_eq!(twice.added, 0);
            prop_assert_eq!(twice.ledger.rows(), once.ledger.rows());
        }

        #[test]
        fn test_merge_keeps_existing_rows_as_prefix(existing in arb_ledger_rows(), batch in arb_batch()) {
            let result = merge(ledger(existing.clone()), &batch);

            prop_assert_eq!(&result.ledger.rows()[..existing.len()], existing.as_slice());
            prop_assert_eq!(result.ledger.len(), existing.len() + result.added);
        }

        #[test]
        fn test_merge_contains_every_row_exactly_once(existing in arb_ledger_rows(), batch in arb_batch()) {
            let result = merge(ledger(existing.clone()), &batch);
            let rows = result.ledger.rows();

            for row in existing.iter().chain(&batch) {
                prop_assert_eq!(rows.iter().filter(|r| *r == row).count(), 1);
            }

            // Additions are the unseen rows in first-encounter order
            let mut expected: Vec<Row> = Vec::new();
            for row in &batch {
                if !existing.contains(row) && !expected.contains(row) {
                    expected.push(row.clone());
                }
            }
            prop_assert_eq!(result.additions(), expected.as_slice());
            prop_assert_eq!(result.duplicates, batch.len() - result.added);
        }
    }
}
