//! Mapping free-form request text to a skill.
//!
//! [`KeywordRouter`] is the deterministic router; [`FallbackRouter`] puts a
//! smarter (possibly remote) router in front of it and falls back to keywords
//! when that one fails.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};

/// Skill name for character reversal
pub const SKILL_REVERSE: &str = "reverse";
/// Skill name for uppercase conversion
pub const SKILL_UPPERCASE: &str = "uppercase";
/// Skill name for news search
pub const SKILL_NEWS: &str = "news";

/// Keywords per skill, checked in order; the first hit wins.
const KEYWORDS: &[(&str, &[&str])] = &[
    (SKILL_REVERSE, &["reverse"]),
    (SKILL_UPPERCASE, &["uppercase", "upper", "capitalize"]),
    (SKILL_NEWS, &["news", "search", "find"]),
];

/// Which skill to invoke and with what input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub skill: String,
    pub content: String,
}

/// Decides which skill handles a request.
#[async_trait]
pub trait SkillRouter: Send + Sync {
    async fn route(&self, text: &str) -> AgentResult<RouteDecision>;
}

/// Keyword-matching router.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordRouter;

impl KeywordRouter {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous form of [`SkillRouter::route`].
    pub fn decide(&self, text: &str) -> AgentResult<RouteDecision> {
        let lower = text.to_ascii_lowercase();
        let (skill, keyword) = match_keyword(&lower)
            .ok_or_else(|| AgentError::UnresolvedSkill(text.to_string()))?;

        Ok(RouteDecision {
            skill: skill.to_string(),
            content: extract_content(text, &lower, keyword),
        })
    }
}

#[async_trait]
impl SkillRouter for KeywordRouter {
    async fn route(&self, text: &str) -> AgentResult<RouteDecision> {
        self.decide(text)
    }
}

/// Tries `primary` first and falls back to keyword routing on failure.
pub struct FallbackRouter<P> {
    primary: P,
    fallback: KeywordRouter,
}

impl<P: SkillRouter> FallbackRouter<P> {
    pub fn new(primary: P) -> Self {
        Self {
            primary,
            fallback: KeywordRouter,
        }
    }
}

#[async_trait]
impl<P: SkillRouter> SkillRouter for FallbackRouter<P> {
    async fn route(&self, text: &str) -> AgentResult<RouteDecision> {
        match self.primary.route(text).await {
            Ok(decision) => Ok(decision),
            Err(e) => {
                warn!(error = %e, "Primary router failed, using keyword routing");
                self.fallback.decide(text)
            }
        }
    }
}

/// Skill a caller should target for `text`; `reverse` when nothing matches.
pub fn determine_target_skill(text: &str) -> &'static str {
    let lower = text.to_ascii_lowercase();
    let skill = match_keyword(&lower).map_or(SKILL_REVERSE, |(skill, _)| skill);
    debug!(skill, "Determined target skill");
    skill
}

fn match_keyword(lower: &str) -> Option<(&'static str, &'static str)> {
    KEYWORDS.iter().find_map(|(skill, keywords)| {
        keywords
            .iter()
            .find(|keyword| lower.contains(*keyword))
            .map(|keyword| (*skill, *keyword))
    })
}

/// Text after the first `:`, else after the keyword, else everything.
///
/// `lower` is the ASCII-lowercased `text`, so byte offsets agree.
fn extract_content(text: &str, lower: &str, keyword: &str) -> String {
    if let Some((_, after)) = text.split_once(':') {
        return after.trim().to_string();
    }
    if let Some(index) = lower.find(keyword) {
        return text[index + keyword.len()..]
            .trim()
            .trim_start_matches([':', ' ', '-'])
            .to_string();
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decide(text: &str) -> RouteDecision {
        KeywordRouter::new().decide(text).unwrap()
    }

    #[test]
    fn test_content_after_colon() {
        let decision = decide("reverse: hello world");
        assert_eq!(decision.skill, "reverse");
        assert_eq!(decision.content, "hello world");

        let decision = decide("make this UPPER: test");
        assert_eq!(decision.skill, "uppercase");
        assert_eq!(decision.content, "test");
    }

    #[test]
    fn test_content_after_keyword() {
        assert_eq!(decide("Reverse - Hi Ravi?").content, "Hi Ravi?");
        assert_eq!(decide("uppercase hello").content, "hello");
        assert_eq!(decide("capitalize shout").content, "shout");

        let decision = decide("find news about AI");
        assert_eq!(decision.skill, "news");
        assert_eq!(decision.content, "about AI");
    }

    #[test]
    fn test_keyword_priority() {
        // "reverse" outranks "upper"
        assert_eq!(decide("reverse the upper text").skill, "reverse");
        assert_eq!(decide("search for something").skill, "news");
    }

    #[test]
    fn test_unresolved() {
        let err = KeywordRouter::new().decide("hello there").unwrap_err();
        assert!(matches!(err, AgentError::UnresolvedSkill(text) if text == "hello there"));
    }

    #[test]
    fn test_determine_target_skill_defaults_to_reverse() {
        assert_eq!(determine_target_skill("CAPITALIZE me"), "uppercase");
        assert_eq!(determine_target_skill("latest news"), "news");
        assert_eq!(determine_target_skill("what is this"), "reverse");
    }

    struct Failing;

    #[async_trait]
    impl SkillRouter for Failing {
        async fn route(&self, text: &str) -> AgentResult<RouteDecision> {
            Err(AgentError::UnresolvedSkill(text.to_string()))
        }
    }

    struct Fixed;

    #[async_trait]
    impl SkillRouter for Fixed {
        async fn route(&self, _text: &str) -> AgentResult<RouteDecision> {
            Ok(RouteDecision {
                skill: "uppercase".to_string(),
                content: "fixed".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_fallback_router() {
        let router = FallbackRouter::new(Failing);
        let decision = router.route("reverse: abc").await.unwrap();
        assert_eq!(decision.content, "abc");

        let router = FallbackRouter::new(Fixed);
        let decision = router.route("reverse: abc").await.unwrap();
        assert_eq!(decision.skill, "uppercase");
        assert_eq!(decision.content, "fixed");
    }
}
