//! Perspective decomposition of a researcher step.

use crate::domain::{ResearchTask, SearchMode, Step};

use super::{ResearchPatterns, ResearchSettings};

/// Angles used to widen a decomposition that came out too narrow
const DIVERSIFY: [(&str, &str); 4] = [
    ("background", "history and key definitions"),
    ("recent data", "latest statistics and trends"),
    ("case studies", "concrete examples"),
    ("counterpoints", "criticism and limitations"),
];

const TOPIC_CHARS: usize = 80;

/// Text of a bullet line (`-`, `*`, `•`, `・`, `1.`, `1)`), if it is one
pub fn parse_bullet(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();

    for marker in ["-", "*", "•", "・"] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            let rest = rest.trim();
            return (!rest.is_empty()).then_some(rest);
        }
    }

    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &trimmed[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            let rest = rest.trim();
            return (!rest.is_empty()).then_some(rest);
        }
    }

    None
}

/// Distinct bullet lines following the first perspective marker
fn bulleted_perspectives(text: &str, patterns: &ResearchPatterns) -> Vec<String> {
    let mut found = Vec::new();
    let mut in_list = false;

    for line in text.lines() {
        if !in_list {
            in_list = patterns.is_perspective_marker(line);
            continue;
        }

        if line.trim().is_empty() {
            if found.is_empty() {
                continue;
            }
            break;
        }

        match parse_bullet(line) {
            Some(bullet) => {
                let repeated = found
                    .iter()
                    .any(|seen: &String| seen.to_lowercase() == bullet.to_lowercase());
                if !repeated {
                    found.push(bullet.to_string());
                }
            }
            None => break,
        }
    }

    found
}

fn topic_of(step: &Step) -> String {
    let source = if step.title.trim().is_empty() {
        step.instruction
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("the requested topic")
    } else {
        step.title.trim()
    };
    source.chars().take(TOPIC_CHARS).collect()
}

fn task(perspective: String, hint: String, priority: u32, search_mode: SearchMode) -> ResearchTask {
    ResearchTask {
        id: 0,
        expected_output: format!("Findings on '{}' with cited sources", perspective),
        perspective,
        query_hints: vec![hint],
        priority,
        search_mode,
    }
}

/// Split a researcher step into independent perspectives.
///
/// Bullets under a perspective marker become one task each. Fewer than
/// `min_tasks` are widened with synthesized angles; the list is capped at
/// `max_tasks`. Ids are assigned by position starting at 1.
pub fn decompose(
    step: &Step,
    patterns: &ResearchPatterns,
    settings: &ResearchSettings,
    search_mode: SearchMode,
) -> Vec<ResearchTask> {
    let text = format!("{}\n\n{}", step.instruction, step.description);
    let topic = topic_of(step);

    let mut tasks: Vec<ResearchTask> = bulleted_perspectives(&text, patterns)
        .into_iter()
        .map(|bullet| task(bullet.clone(), bullet, 1, search_mode))
        .collect();

    if tasks.is_empty() {
        tasks.push(task(topic.clone(), topic.clone(), 1, search_mode));
    }

    let mut angles = DIVERSIFY.iter();
    while tasks.len() < settings.min_tasks {
        let Some((angle, hint)) = angles.next() else {
            break;
        };
        tasks.push(task(
            format!("{}: {}", topic, angle),
            format!("{} {}", topic, hint),
            2,
            search_mode,
        ));
    }

    tasks.truncate(settings.max_tasks.max(settings.min_tasks));
    for (i, task) in tasks.iter_mut().enumerate() {
        task.id = i as u32 + 1;
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Capability;

    fn setup() -> (ResearchPatterns, ResearchSettings) {
        let settings = ResearchSettings::default();
        (settings.compile().unwrap(), settings)
    }

    #[test]
    fn test_parse_bullet_variants() {
        assert_eq!(parse_bullet("- market size"), Some("market size"));
        assert_eq!(parse_bullet("  * pricing"), Some("pricing"));
        assert_eq!(parse_bullet("• regulation"), Some("regulation"));
        assert_eq!(parse_bullet("・市場規模"), Some("市場規模"));
        assert_eq!(parse_bullet("1. history"), Some("history"));
        assert_eq!(parse_bullet("12) outlook"), Some("outlook"));
        assert_eq!(parse_bullet("plain text"), None);
        assert_eq!(parse_bullet("-"), None);
        assert_eq!(parse_bullet("2024 was a good year"), None);
    }

    #[test]
    fn test_bullets_become_tasks() {
        let (patterns, settings) = setup();
        let step = Step::new(
            1,
            Capability::Researcher,
            "Research EV adoption.\nResearch perspectives:\n- market size\n- charging infrastructure\n- policy incentives\n\nKeep it short.",
        );

        let tasks = decompose(&step, &patterns, &settings, SearchMode::Text);
        let perspectives: Vec<_> = tasks.iter().map(|t| t.perspective.as_str()).collect();
        assert_eq!(
            perspectives,
            vec!["market size", "charging infrastructure", "policy incentives"]
        );
        assert_eq!(tasks[0].query_hints, vec!["market size".to_string()]);
        assert_eq!(tasks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_japanese_marker_and_bullets() {
        let (patterns, settings) = setup();
        let step = Step::new(
            1,
            Capability::Researcher,
            "生成AIの市場を調べる\n調査観点:\n・市場規模\n・主要企業",
        );

        let tasks = decompose(&step, &patterns, &settings, SearchMode::Text);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].perspective, "市場規模");
        assert_eq!(tasks[1].perspective, "主要企業");
    }

    #[test]
    fn test_single_bullet_is_diversified() {
        let (patterns, settings) = setup();
        let step = Step::new(
            1,
            Capability::Researcher,
            "Research perspectives:\n- battery chemistry",
        )
        .with_title("EV batteries");

        let tasks = decompose(&step, &patterns, &settings, SearchMode::Text);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].perspective, "battery chemistry");
        assert_eq!(tasks[1].perspective, "EV batteries: background");
        assert_eq!(tasks[1].priority, 2);
    }

    #[test]
    fn test_repeated_bullets_are_collapsed() {
        let (patterns, settings) = setup();
        let step = Step::new(
            1,
            Capability::Researcher,
            "Research perspectives:\n- market\n- Market\n- market",
        )
        .with_title("Tea exports");

        let tasks = decompose(&step, &patterns, &settings, SearchMode::Text);
        let perspectives: Vec<_> = tasks.iter().map(|t| t.perspective.as_str()).collect();
        assert_eq!(perspectives, vec!["market", "Tea exports: background"]);
    }

    #[test]
    fn test_no_marker_uses_topic() {
        let (patterns, settings) = setup();
        let step = Step::new(1, Capability::Researcher, "Look into remote work trends");

        let tasks = decompose(&step, &patterns, &settings, SearchMode::TextAndImages);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].perspective, "Look into remote work trends");
        assert!(tasks.iter().all(|t| t.search_mode == SearchMode::TextAndImages));
    }

    #[test]
    fn test_cap_at_max_tasks() {
        let (patterns, settings) = setup();
        let bullets: String = (1..=8).map(|i| format!("- angle {}\n", i)).collect();
        let step = Step::new(
            1,
            Capability::Researcher,
            format!("Research perspectives:\n{}", bullets),
        );

        let tasks = decompose(&step, &patterns, &settings, SearchMode::Text);
        assert_eq!(tasks.len(), 5);
        assert_eq!(tasks[4].perspective, "angle 5");
    }
}
