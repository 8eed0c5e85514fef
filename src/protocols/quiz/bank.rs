//! Question bank loading.
//!
//! The question file holds groups of three lines: the question, its answer
//! and a blank separator line. The separator after the last group may be
//! omitted.

use std::path::{Path, PathBuf};

/// Longest accepted question line, in bytes.
pub const QUESTION_MAX_SIZE: usize = 512;

/// Longest accepted answer line, in bytes.
pub const ANSWER_MAX_SIZE: usize = 64;

/// One question with its answer, without line terminators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizEntry {
    pub question: String,
    pub answer: String,
}

/// Immutable set of questions served to clients.
#[derive(Debug, Clone)]
pub struct QuizBank {
    entries: Vec<QuizEntry>,
}

impl QuizBank {
    /// Read and parse a question file.
    pub fn load(path: &Path) -> Result<Self, QuizError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| QuizError::FileRead(path.to_path_buf(), e))?;
        Self::parse(&contents)
    }

    /// Parse question file contents.
    pub fn parse(contents: &str) -> Result<Self, QuizError> {
        let mut entries = Vec::new();
        let mut lines = contents.lines().enumerate().map(|(i, l)| (i + 1, l));

        while let Some((line_no, question)) = lines.next() {
            if question.trim().is_empty() {
                // Tolerate extra separator lines.
                continue;
            }
            let (answer_line, answer) = lines.next().ok_or(QuizError::MissingAnswer(line_no))?;

            if question.len() > QUESTION_MAX_SIZE {
                return Err(QuizError::TooLong(line_no));
            }
            if answer.trim().is_empty() {
                return Err(QuizError::MissingAnswer(line_no));
            }
            if answer.len() > ANSWER_MAX_SIZE {
                return Err(QuizError::TooLong(answer_line));
            }

            entries.push(QuizEntry {
                question: question.to_string(),
                answer: answer.to_string(),
            });
        }

        if entries.is_empty() {
            return Err(QuizError::Empty);
        }
        Ok(QuizBank { entries })
    }

    /// Entry by index.
    pub fn get(&self, idx: usize) -> Option<&QuizEntry> {
        self.entries.get(idx)
    }

    /// Number of questions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the bank holds no questions. Never true for a loaded bank.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Question file errors
#[derive(Debug)]
pub enum QuizError {
    FileRead(PathBuf, std::io::Error),
    /// Question on the given line has no answer line.
    MissingAnswer(usize),
    /// Line exceeds the question or answer size limit.
    TooLong(usize),
    Empty,
}

impl std::fmt::Display for QuizError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuizError::FileRead(path, e) => {
                write!(f, "Failed to read quiz file '{}': {}", path.display(), e)
            }
            QuizError::MissingAnswer(line) => write!(f, "Question on line {} has no answer", line),
            QuizError::TooLong(line) => write!(f, "Line {} of the quiz file is too long", line),
            QuizError::Empty => write!(f, "Quiz file contains no questions"),
        }
    }
}

impl std::error::Error for QuizError {}
