//! Convergence analysis: decides when a session's next turn is expected
//! to add no new information.
//!
//! Pure functions over session state; re-running on the same state yields
//! identical signals and confidence.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::ConvergenceConfig;
use crate::session::{ConversationSession, TurnMessage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceSignals {
    pub repetitive_content: bool,
    pub explicit_completion: bool,
    pub resource_exhaustion: bool,
    pub quality_degradation: bool,
}

impl ConvergenceSignals {
    pub fn any(&self) -> bool {
        self.repetitive_content
            || self.explicit_completion
            || self.resource_exhaustion
            || self.quality_degradation
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub turns_analyzed: usize,
    pub avg_turn_length: f64,
    pub matched_keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub should_continue: bool,
    pub confidence: f64,
    pub signals: ConvergenceSignals,
    pub recommendations: Vec<String>,
    pub metadata: AnalysisMetadata,
}

/// Analyzer over a session's turn history and resource state.
pub struct ConvergenceAnalyzer {
    config: ConvergenceConfig,
}

impl ConvergenceAnalyzer {
    pub fn new(config: ConvergenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    pub fn analyze(&self, session: &ConversationSession) -> ConvergenceReport {
        let history = session.turn_history();
        let mut matched_keywords = Vec::new();

        let explicit_completion = match history.last() {
            Some(last) => {
                let lower = last.content.to_lowercase();
                for phrase in &self.config.completion_phrases {
                    if lower.contains(&phrase.to_lowercase()) {
                        matched_keywords.push(phrase.clone());
                    }
                }
                !matched_keywords.is_empty()
            }
            None => false,
        };

        let repetitive_content = self.is_repetitive(history);
        let resource_exhaustion = session.turns_remaining() <= 1
            || session.cost_remaining()
                <= session.budget() * self.config.exhaustion_budget_fraction;
        let quality_degradation = self.is_degraded(history);

        let signals = ConvergenceSignals {
            repetitive_content,
            explicit_completion,
            resource_exhaustion,
            quality_degradation,
        };

        let w = &self.config.weights;
        let mut confidence = 0.0;
        if explicit_completion {
            confidence += w.explicit;
        }
        if resource_exhaustion {
            confidence += w.exhaustion;
        }
        if repetitive_content {
            confidence += w.repetitive;
        }
        if quality_degradation {
            confidence += w.degradation;
        }
        let confidence = confidence.min(1.0);

        // Degradation alone lowers quality but does not end a session.
        let should_continue =
            !(explicit_completion || resource_exhaustion || repetitive_content);

        let total_chars: usize = history.iter().map(|t| t.content.chars().count()).sum();
        let metadata = AnalysisMetadata {
            turns_analyzed: history.len(),
            avg_turn_length: if history.is_empty() {
                0.0
            } else {
                total_chars as f64 / history.len() as f64
            },
            matched_keywords,
        };

        ConvergenceReport {
            should_continue,
            confidence,
            signals,
            recommendations: Self::recommendations(&signals, w),
            metadata,
        }
    }

    /// Last turn vs any of the previous three, Jaccard over token shingles.
    fn is_repetitive(&self, history: &[TurnMessage]) -> bool {
        let Some((last, earlier)) = history.split_last() else {
            return false;
        };
        let last_shingles = self.shingles(&last.content);
        if last_shingles.is_empty() {
            return false;
        }

        earlier.iter().rev().take(3).any(|prev| {
            let prev_shingles = self.shingles(&prev.content);
            jaccard(&last_shingles, &prev_shingles) > self.config.similarity_threshold
        })
    }

    /// Average content length of the last three turns against the
    /// session-wide average.
    fn is_degraded(&self, history: &[TurnMessage]) -> bool {
        if history.len() < 3 {
            return false;
        }
        let session_avg = history.iter().map(|t| t.content.chars().count()).sum::<usize>() as f64
            / history.len() as f64;
        if session_avg <= 0.0 {
            return false;
        }
        let recent_avg = history
            .iter()
            .rev()
            .take(3)
            .map(|t| t.content.chars().count())
            .sum::<usize>() as f64
            / 3.0;

        recent_avg < session_avg * self.config.degradation_ratio
    }

    fn shingles(&self, text: &str) -> HashSet<String> {
        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();

        let n = self.config.shingle_size;
        if tokens.is_empty() {
            return HashSet::new();
        }
        if tokens.len() < n {
            return HashSet::from([tokens.join(" ")]);
        }

        tokens.windows(n).map(|w| w.join(" ")).collect()
    }

    fn recommendations(
        signals: &ConvergenceSignals,
        weights: &crate::config::SignalWeights,
    ) -> Vec<String> {
        // Keyed off the dominant (highest-weight) fired signal.
        let mut fired: Vec<(f64, &str)> = Vec::new();
        if signals.explicit_completion {
            fired.push((
                weights.explicit,
                "conversation signaled completion; close the session",
            ));
        }
        if signals.resource_exhaustion {
            fired.push((
                weights.exhaustion,
                "resources nearly exhausted; wrap up within the next turn",
            ));
        }
        if signals.repetitive_content {
            fired.push((
                weights.repetitive,
                "recent turns repeat earlier content; close or redirect",
            ));
        }
        if signals.quality_degradation {
            fired.push((
                weights.degradation,
                "turn quality is collapsing; consider intervening",
            ));
        }

        if fired.is_empty() {
            return vec!["continue conversation; progress is being made".to_string()];
        }

        fired.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        fired.into_iter().map(|(_, text)| text.to_string()).collect()
    }
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use crate::session::{MessageRole, TurnMessage};

    fn analyzer() -> ConvergenceAnalyzer {
        ConvergenceAnalyzer::new(ConvergenceConfig::default())
    }

    fn session(max_turns: u32, budget: f64) -> ConversationSession {
        ConversationSession::new(
            vec!["alpha".to_string(), "beta".to_string()],
            "topic",
            "default",
            max_turns,
            budget,
        )
        .unwrap()
    }

    fn add_turn(session: &mut ConversationSession, from: &str, to: &str, content: &str, cost: f64) {
        let turn = TurnMessage::new(
            session.session_id(),
            from,
            to,
            MessageRole::Assistant,
            content,
            Policy::default_policy().snapshot(),
        )
        .unwrap()
        .with_cost(cost);
        session.append(turn).unwrap();
    }

    #[test]
    fn test_empty_session_continues() {
        let report = analyzer().analyze(&session(8, 1.0));
        assert!(report.should_continue);
        assert!(!report.signals.any());
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn test_explicit_completion_detected() {
        let mut s = session(8, 1.0);
        add_turn(&mut s, "alpha", "beta", "Proposal drafted and reviewed.", 0.01);
        add_turn(&mut s, "beta", "alpha", "Looks good. Task complete.", 0.01);

        let report = analyzer().analyze(&s);
        assert!(report.signals.explicit_completion);
        assert!(!report.should_continue);
        assert!(report.confidence >= 0.5);
        assert_eq!(report.metadata.matched_keywords, vec!["task complete"]);
    }

    #[test]
    fn test_korean_completion_phrase() {
        let mut s = session(8, 1.0);
        add_turn(&mut s, "alpha", "beta", "패치 제안을 검토했습니다. 합의 완료.", 0.01);

        let report = analyzer().analyze(&s);
        assert!(report.signals.explicit_completion);
    }

    #[test]
    fn test_repetition_detected() {
        let mut s = session(12, 10.0);
        let repeated = "the parser drops the trailing newline before tokenizing the input stream";
        add_turn(&mut s, "alpha", "beta", repeated, 0.01);
        add_turn(&mut s, "beta", "alpha", "could you elaborate on the root cause here", 0.01);
        add_turn(&mut s, "alpha", "beta", repeated, 0.01);

        let report = analyzer().analyze(&s);
        assert!(report.signals.repetitive_content);
        assert!(!report.should_continue);
    }

    #[test]
    fn test_distinct_turns_not_repetitive() {
        let mut s = session(12, 10.0);
        add_turn(&mut s, "alpha", "beta", "the parser drops the trailing newline", 0.01);
        add_turn(&mut s, "beta", "alpha", "reproduced it with an empty buffer instead", 0.01);

        let report = analyzer().analyze(&s);
        assert!(!report.signals.repetitive_content);
    }

    #[test]
    fn test_exhaustion_on_last_turn() {
        let mut s = session(2, 10.0);
        add_turn(&mut s, "alpha", "beta", "first answer", 0.01);

        let report = analyzer().analyze(&s);
        assert!(report.signals.resource_exhaustion);
        assert!(!report.should_continue);
    }

    #[test]
    fn test_exhaustion_on_budget_fraction() {
        let mut s = session(10, 1.0);
        add_turn(&mut s, "alpha", "beta", "expensive analysis", 0.96);

        let report = analyzer().analyze(&s);
        assert!(report.signals.resource_exhaustion);
    }

    #[test]
    fn test_quality_degradation() {
        let mut s = session(12, 10.0);
        let long = "a detailed root cause analysis paragraph ".repeat(20);
        add_turn(&mut s, "alpha", "beta", &long, 0.01);
        add_turn(&mut s, "beta", "alpha", &long, 0.01);
        add_turn(&mut s, "alpha", "beta", "ok", 0.01);
        add_turn(&mut s, "beta", "alpha", "yes", 0.01);
        add_turn(&mut s, "alpha", "beta", "sure", 0.01);

        let report = analyzer().analyze(&s);
        assert!(report.signals.quality_degradation);
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let mut s = session(8, 1.0);
        add_turn(&mut s, "alpha", "beta", "proposal with details", 0.2);
        add_turn(&mut s, "beta", "alpha", "counter proposal with details", 0.2);

        let first = analyzer().analyze(&s);
        let second = analyzer().analyze(&s);
        assert_eq!(first, second);
    }

    #[test]
    fn test_confidence_saturates_at_one() {
        let mut config = ConvergenceConfig::default();
        config.weights.explicit = 0.9;
        config.weights.exhaustion = 0.9;
        let analyzer = ConvergenceAnalyzer::new(config);

        let mut s = session(1, 1.0);
        add_turn(&mut s, "alpha", "beta", "final answer: task complete", 0.01);

        let report = analyzer.analyze(&s);
        assert!(report.signals.explicit_completion);
        assert!(report.signals.resource_exhaustion);
        assert!((report.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_auto_complete_thresholds() {
        let config = ConvergenceConfig::default();
        let analyzer = ConvergenceAnalyzer::new(config.clone());

        // Explicit completion alone scores 0.5, below the 0.8 floor.
        let mut s = session(8, 1.0);
        add_turn(&mut s, "alpha", "beta", "proposal", 0.01);
        add_turn(&mut s, "beta", "alpha", "task complete", 0.01);
        let report = analyzer.analyze(&s);
        assert!(!s.should_auto_complete(&report, &config));

        // Explicit plus exhaustion scores 0.8 and clears it.
        let mut near_end = session(2, 1.0);
        add_turn(&mut near_end, "alpha", "beta", "task complete", 0.01);
        let report = analyzer.analyze(&near_end);
        assert!(near_end.should_auto_complete(&report, &config));

        let mut quiet = session(8, 1.0);
        add_turn(&mut quiet, "alpha", "beta", "still iterating on the idea", 0.01);
        let report = analyzer.analyze(&quiet);
        assert!(!quiet.should_auto_complete(&report, &config));
    }
}
