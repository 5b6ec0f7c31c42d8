//! Indexing solution selection.
//!
//! The strategy engine reports candidate lattices from indexing, ordered by
//! ascending quality-of-fit. [`select_solution`] picks the one to propose,
//! honouring lattice and crystal-family hints from the sample; the choice is
//! deterministic for a fixed candidate ordering.

use crate::model::{ChooseLattice, UnitCell};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only indexing table format understood.
pub const IDXREF_FORMAT: &str = "IDXREF";

const IDXREF_HEADER: &str = "  LATTICE-  BRAVAIS-   QUALITY  UNIT CELL CONSTANTS (ANGSTROEM & DEGREES)\n CHARACTER  LATTICE     OF FIT      a      b      c   alpha  beta gamma";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SelectionError {
    #[error("No indexing solutions to choose from")]
    NoCandidates,
    #[error("None of the {0} indexing solutions is consistent")]
    NoConsistentSolution(usize),
    #[error("Indexing format {0} not supported")]
    UnsupportedFormat(String),
}

/// A candidate crystal lattice interpretation of diffraction data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexingSolution {
    pub lattice_character: u32,
    /// Bravais lattice tag such as `mC` or `tP`
    pub bravais_lattice: String,
    pub quality_of_fit: f64,
    pub cell: UnitCell,
    pub is_consistent: bool,
}

impl IndexingSolution {
    /// Renders one IDXREF table row; consistent solutions are starred.
    pub fn table_row(&self) -> String {
        let [a, b, c] = self.cell.lengths;
        let [alpha, beta, gamma] = self.cell.angles;
        format!(
            " {}  {:2}        {} {:12.1}    {:6.1} {:6.1} {:6.1} {:5.1} {:5.1} {:5.1}",
            if self.is_consistent { '*' } else { ' ' },
            self.lattice_character,
            self.bravais_lattice,
            self.quality_of_fit,
            a,
            b,
            c,
            alpha,
            beta,
            gamma,
        )
    }
}

/// Picks the index of the best solution in `solutions`.
///
/// First match wins:
/// 1. the first consistent solution whose lattice is in `lattices`;
/// 2. failing that, a crystal family is derived from `lattices` when none was
///    given and all allowed lattices share their first letter;
/// 3. the first consistent solution in that crystal family;
/// 4. the first solution sharing the lattice of the last consistent solution.
pub fn select_solution(
    solutions: &[IndexingSolution],
    lattices: &[String],
    crystal_family: Option<char>,
) -> Result<usize, SelectionError> {
    if solutions.is_empty() {
        return Err(SelectionError::NoCandidates);
    }

    let consistent: Vec<(usize, &IndexingSolution)> = solutions
        .iter()
        .enumerate()
        .filter(|(_, solution)| solution.is_consistent)
        .collect();

    if let Some((index, _)) = consistent
        .iter()
        .find(|(_, solution)| lattices.contains(&solution.bravais_lattice))
    {
        return Ok(*index);
    }

    let family = crystal_family.or_else(|| common_family(lattices));
    if let Some(family) = family {
        if let Some((index, _)) = consistent
            .iter()
            .find(|(_, solution)| solution.bravais_lattice.starts_with(family))
        {
            return Ok(*index);
        }
    }

    let (_, last) = consistent
        .last()
        .ok_or(SelectionError::NoConsistentSolution(solutions.len()))?;
    consistent
        .iter()
        .find(|(_, solution)| solution.bravais_lattice == last.bravais_lattice)
        .map(|(index, _)| *index)
        .ok_or(SelectionError::NoConsistentSolution(solutions.len()))
}

/// Crystal family letter shared by every allowed lattice, if there is one.
fn common_family(lattices: &[String]) -> Option<char> {
    let mut letters = lattices.iter().filter_map(|lattice| lattice.chars().next());
    let first = letters.next()?;
    letters.all(|letter| letter == first).then_some(first)
}

/// Selection for a full lattice request, checking the table format first.
pub fn select_for_request(request: &ChooseLattice) -> Result<usize, SelectionError> {
    if request.indexing_format != IDXREF_FORMAT {
        return Err(SelectionError::UnsupportedFormat(
            request.indexing_format.clone(),
        ));
    }
    select_solution(
        &request.solutions,
        &request.lattices,
        request.crystal_family_char,
    )
}

/// IDXREF-style table of all candidates, as shown to an operator.
pub fn format_solution_table(solutions: &[IndexingSolution]) -> String {
    let mut table = String::from(IDXREF_HEADER);
    for solution in solutions {
        table.push('\n');
        table.push_str(&solution.table_row());
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solution(character: u32, lattice: &str, fit: f64, consistent: bool) -> IndexingSolution {
        IndexingSolution {
            lattice_character: character,
            bravais_lattice: lattice.to_string(),
            quality_of_fit: fit,
            cell: UnitCell {
                lengths: [56.3, 56.3, 102.3],
                angles: [90.0, 90.0, 90.0],
            },
            is_consistent: consistent,
        }
    }

    fn idxref_sample() -> Vec<IndexingSolution> {
        vec![
            solution(44, "aP", 0.0, true),
            solution(33, "mP", 0.0, true),
            solution(32, "oP", 0.0, true),
            solution(14, "mC", 0.1, true),
            solution(13, "oC", 0.1, true),
            solution(11, "tP", 0.1, true),
            solution(37, "mC", 250.0, false),
            solution(12, "hP", 250.1, false),
        ]
    }

    #[test]
    fn test_empty_candidates_fail() {
        assert_eq!(select_solution(&[], &[], None), Err(SelectionError::NoCandidates));
    }

    #[test]
    fn test_allowed_lattice_wins() {
        let solutions = vec![
            solution(11, "tP", 0.1, true),
            solution(37, "hP", 250.0, false),
            solution(14, "mC", 0.2, true),
        ];
        assert_eq!(select_solution(&solutions, &["mC".to_string()], None), Ok(2));
    }

    #[test]
    fn test_inconsistent_match_is_skipped() {
        let solutions = idxref_sample();
        // hP only appears as an inconsistent solution, so fall through to the last consistent
        assert_eq!(select_solution(&solutions, &["hP".to_string()], None), Ok(5));
    }

    #[test]
    fn test_family_derived_from_lattices() {
        let solutions = idxref_sample();
        let lattices = vec!["oF".to_string(), "oI".to_string()];
        assert_eq!(select_solution(&solutions, &lattices, None), Ok(2));
    }

    #[test]
    fn test_mixed_families_are_not_derived() {
        let solutions = idxref_sample();
        let lattices = vec!["oF".to_string(), "hR".to_string()];
        assert_eq!(select_solution(&solutions, &lattices, None), Ok(5));
    }

    #[test]
    fn test_explicit_family() {
        let solutions = idxref_sample();
        assert_eq!(select_solution(&solutions, &[], Some('m')), Ok(1));
    }

    #[test]
    fn test_fallback_to_first_with_last_consistent_lattice() {
        let solutions = vec![
            solution(44, "aP", 0.0, true),
            solution(14, "mC", 0.1, true),
            solution(10, "aP", 0.1, true),
        ];
        assert_eq!(select_solution(&solutions, &[], None), Ok(0));
    }

    #[test]
    fn test_no_consistent_solution() {
        let solutions = vec![solution(37, "mC", 250.0, false)];
        assert_eq!(
            select_solution(&solutions, &[], None),
            Err(SelectionError::NoConsistentSolution(1))
        );
    }

    #[test]
    fn test_selection_is_deterministic() {
        let solutions = idxref_sample();
        let lattices = vec!["oC".to_string()];
        let first = select_solution(&solutions, &lattices, Some('t'));
        for _ in 0..10 {
            assert_eq!(select_solution(&solutions, &lattices, Some('t')), first);
        }
    }

    #[test]
    fn test_unsupported_format() {
        let request = ChooseLattice {
            indexing_format: "DIALS".to_string(),
            solutions: idxref_sample(),
            lattices: vec![],
            crystal_family_char: None,
        };
        assert_eq!(
            select_for_request(&request),
            Err(SelectionError::UnsupportedFormat("DIALS".to_string()))
        );
    }

    #[test]
    fn test_table_marks_consistent_rows() {
        let table = format_solution_table(&idxref_sample());
        let rows: Vec<&str> = table.lines().skip(2).collect();
        assert_eq!(rows.len(), 8);
        assert!(rows[0].starts_with(" *  44        aP"));
        assert!(rows[6].starts_with("    37        mC"));
    }
}
