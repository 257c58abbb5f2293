use async_trait::async_trait;
use memoria_core::{MemoriaResult, ReviewChannel, ReviewDecision, ReviewRequest, RiskLevel};
use std::time::Duration;

/// Terminal reviewer that prompts on stderr and reads the decision from stdin.
///
/// Used by `memoria issue --interactive`. An unanswered prompt is denied
/// once the timeout elapses.
pub struct StdinReviewChannel {
    timeout: Duration,
}

impl StdinReviewChannel {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// How long a prompt waits for an answer.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Full prompt with ANSI colors.
pub fn format_review_prompt(request: &ReviewRequest) -> String {
    let (color, label) = risk_level_style(request.max_risk);

    let mut prompt = String::new();
    prompt.push_str("\n\x1b[1;37m╔══ REVIEW REQUIRED ══╗\x1b[0m\n");
    prompt.push_str(&format!("  Proposal: {}\n", request.proposal_id));
    prompt.push_str(&format!("  Category: {}\n", request.category));
    prompt.push_str(&format!("  Risk:     \x1b[{color}m{label}\x1b[0m\n"));
    prompt.push_str(&format!("  Desc:     {}\n", request.description));
    for (i, item) in request.items.iter().enumerate() {
        prompt.push_str(&format!("  {:>2}. {item}\n", i + 1));
    }
    prompt.push_str("\x1b[1;37m╚═════════════════════╝\x1b[0m\n");
    prompt.push_str("  Approve? [y/N/reason]: ");
    prompt
}

/// ANSI color code and label for a risk level.
pub fn risk_level_style(level: RiskLevel) -> (&'static str, &'static str) {
    match level {
        RiskLevel::Low => ("32", "LOW"),
        RiskLevel::Medium => ("36", "MEDIUM"),
        RiskLevel::High => ("33", "HIGH"),
        RiskLevel::Critical => ("1;31", "CRITICAL"),
    }
}

/// `y`/`yes` approves; `n`/`no`/empty denies; anything else denies with the
/// text as the reason.
pub fn parse_review_input(input: &str) -> (bool, Option<String>) {
    let trimmed = input.trim();
    match trimmed.to_lowercase().as_str() {
        "y" | "yes" => (true, None),
        "n" | "no" | "" => (false, None),
        _ => (false, Some(trimmed.to_string())),
    }
}

fn reviewer_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "cli-user".to_string())
}

#[async_trait]
impl ReviewChannel for StdinReviewChannel {
    async fn request_review(&self, request: ReviewRequest) -> MemoriaResult<ReviewDecision> {
        eprint!("{}", format_review_prompt(&request));

        let timeout = self.timeout;
        let result = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(|| {
                let mut input = String::new();
                std::io::stdin().read_line(&mut input).map(|_| input)
            }),
        )
        .await;

        let reviewer = reviewer_name();
        let decision = match result {
            Ok(Ok(Ok(input))) => {
                let (approved, reason) = parse_review_input(&input);
                ReviewDecision {
                    approved,
                    reason,
                    reviewer,
                }
            }
            Ok(Ok(Err(_))) | Ok(Err(_)) => {
                ReviewDecision::reject(reviewer, "stdin read error")
            }
            Err(_) => ReviewDecision::reject(
                reviewer,
                format!("Timed out after {}s", timeout.as_secs()),
            ),
        };

        let label = if decision.approved { "APPROVED" } else { "DENIED" };
        eprintln!("  -> {label}\n");
        Ok(decision)
    }
}
