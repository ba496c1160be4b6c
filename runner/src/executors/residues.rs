use super::ExecutorError;
use itertools::Itertools;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

const NAMES: [&str; 22] = [
    "ALA", "ARG", "ASN", "ASP", "CYS", "GLU", "GLN", "GLY", "HIS", "HYP", "ILE", "LEU", "LYS",
    "MET", "PHE", "PRO", "GLP", "SER", "THR", "TRP", "TYR", "VAL",
];
const SHORTS: &str = "ARNDCEQGHOILKMFPUSTWYV";

/// one letter code -> residue name as known to tleap
pub static RESIDUES: Lazy<BTreeMap<char, &'static str>> =
    Lazy::new(|| SHORTS.chars().zip(NAMES).collect());

/// Expand a one letter sequence into a space separated residue list, e.g. `AG` -> `ALA GLY`
pub fn long_names(sequence: &str) -> Result<String, ExecutorError> {
    let names = sequence.chars().map(|code| {
        RESIDUES
            .get(&code)
            .copied()
            .ok_or(ExecutorError::UnknownResidue(code))
    });

    itertools::process_results(names, |mut names| names.join(" "))
}

#[cfg(test)]
mod tests {
    use super::{long_names, RESIDUES, SHORTS};
    use crate::executors::ExecutorError;

    #[test]
    fn table_is_complete() {
        assert_eq!(RESIDUES.len(), SHORTS.len());
        assert_eq!(RESIDUES[&'O'], "HYP");
        assert_eq!(RESIDUES[&'U'], "GLP");
    }

    #[test]
    fn converts_sequences() {
        assert_eq!(long_names("GGGGG").unwrap(), "GLY GLY GLY GLY GLY");
        assert_eq!(long_names("AGW").unwrap(), "ALA GLY TRP");
    }

    #[test]
    fn rejects_unknown_codes() {
        assert!(matches!(long_names("AXG"), Err(ExecutorError::UnknownResidue('X'))));
    }
}
