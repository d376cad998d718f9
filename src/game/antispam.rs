//! Keeps consecutive chat lines distinct enough to get past the server's
//! duplicate filter.
//!
//! The server silently drops a message that is identical or too similar to
//! one of the last few sent on the same channel. Before sending, the message
//! is compared (normalized Levenshtein) against the recent history of its
//! destination; while it is too similar, a space and then random characters
//! are appended to it. Past `max_additions` the message is sent anyway.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::config::AntispamConfig;

pub struct Antispam {
    config: AntispamConfig,
    history: Mutex<HashMap<String, VecDeque<String>>>,
}

impl Antispam {
    pub fn new(config: AntispamConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Return the message to actually send to `destination` and remember it.
    pub fn process(&self, destination: &str, message: &str) -> String {
        if !self.config.enabled {
            return message.to_string();
        }

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let recent = history.entry(destination.to_string()).or_default();

        let mut output = message.to_string();
        let mut score = max_similarity(recent, &output);
        let mut additions = 0;

        if score > self.config.safe_score {
            let mut rng = rand::thread_rng();
            while score > self.config.safe_score && additions < self.config.max_additions {
                if additions == 0 {
                    output.push(' ');
                }
                output.push(char::from(rng.sample(Alphanumeric)));
                additions += 1;
                score = max_similarity(recent, &output);
            }
            debug!(
                destination,
                additions,
                score,
                "Mutated message to avoid duplicate filter"
            );
        }

        recent.push_back(output.clone());
        while recent.len() > self.config.history_size {
            recent.pop_front();
        }
        output
    }
}

fn max_similarity(history: &VecDeque<String>, message: &str) -> f64 {
    history
        .iter()
        .map(|previous| similarity(previous, message))
        .fold(0.0, f64::max)
}

/// `1 - distance / longer length`, so identical strings score 1.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}
