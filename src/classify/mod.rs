//! Transcript classifiers consulted by the turn controller
//!
//! Both classifiers work on normalized text: whitespace and punctuation are
//! stripped, full-width ASCII is folded, katakana is folded to hiragana and
//! Latin letters are lowercased. "サヨウナラ" and " さようなら。" compare equal.

mod filler;
mod normalize;
mod termination;

pub use filler::FillerClassifier;
pub use normalize::{normalize, segments};
pub use termination::{MatchMode, TerminationDetector};
