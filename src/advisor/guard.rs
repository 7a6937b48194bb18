//! Authorization and content-policy guard
//!
//! Runs first in the chain. A request is refused when the caller has no role,
//! holds the lowest-privilege role, or is block-listed; an allow-listed user
//! id always passes authorization. Text containing any banned word is refused
//! regardless of who sent it.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use super::{Advisor, AdvisorContext, AdvisorError, Capability, PipelineRequest};
use crate::config::GuardSettings;

/// Immutable guard rules, loaded once from configuration
#[derive(Debug, Clone)]
pub struct GuardPolicy {
    lowest_role: String,
    allowed_users: HashSet<String>,
    blocked_users: HashSet<String>,
    banned_words: Vec<String>,
}

impl From<&GuardSettings> for GuardPolicy {
    fn from(settings: &GuardSettings) -> Self {
        Self {
            lowest_role: settings.lowest_role.clone(),
            allowed_users: settings.allowed_users.iter().cloned().collect(),
            blocked_users: settings.blocked_users.iter().cloned().collect(),
            banned_words: settings
                .banned_words
                .iter()
                .filter(|w| !w.is_empty())
                .cloned()
                .collect(),
        }
    }
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self::from(&GuardSettings::default())
    }
}

impl GuardPolicy {
    pub fn check_authorization(&self, context: &AdvisorContext) -> Result<(), AdvisorError> {
        let user_id = context.user_id();
        let role = context.user_role();

        tracing::info!(
            "Checking permissions for user {} with role {}",
            user_id.unwrap_or("-"),
            role.unwrap_or("-")
        );

        if user_id.is_some_and(|id| self.allowed_users.contains(id)) {
            return Ok(());
        }

        match role {
            None => Err(AdvisorError::Unauthorized("user role missing".into())),
            Some(role) if role == self.lowest_role => Err(AdvisorError::Unauthorized(format!(
                "role {} may not use the assistant",
                role
            ))),
            Some(_) if user_id.is_some_and(|id| self.blocked_users.contains(id)) => {
                Err(AdvisorError::Unauthorized("user is blocked".into()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Case-sensitive substring match against every banned word
    pub fn check_content(&self, text: &str) -> Result<(), AdvisorError> {
        match self.banned_words.iter().find(|w| text.contains(w.as_str())) {
            Some(word) => {
                tracing::warn!("Banned word detected: {}", word);
                Err(AdvisorError::ContentPolicy { term: word.clone() })
            }
            None => Ok(()),
        }
    }
}

/// Guard stage; priority 0
pub struct AuthCheckAdvisor {
    policy: Arc<GuardPolicy>,
}

impl AuthCheckAdvisor {
    pub fn new(policy: Arc<GuardPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Advisor for AuthCheckAdvisor {
    fn name(&self) -> &str {
        "AuthCheckAdvisor"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn capability(&self) -> Capability {
        Capability::Transform
    }

    async fn before(&self, request: PipelineRequest) -> Result<PipelineRequest, AdvisorError> {
        self.policy.check_authorization(&request.context)?;
        self.policy.check_content(&request.user_text)?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{USER_ID_KEY, USER_ROLE_KEY};
    use tokio_test::{assert_err, assert_ok};

    fn policy() -> GuardPolicy {
        GuardPolicy::from(&GuardSettings {
            allowed_users: vec!["vip".into()],
            blocked_users: vec!["spammer".into()],
            ..GuardSettings::default()
        })
    }

    fn context(user_id: Option<&str>, role: Option<&str>) -> AdvisorContext {
        let mut context = AdvisorContext::new();
        if let Some(id) = user_id {
            context.insert(USER_ID_KEY, id);
        }
        if let Some(role) = role {
            context.insert(USER_ROLE_KEY, role);
        }
        context
    }

    #[test]
    fn test_guest_and_missing_role_rejected() {
        let policy = policy();
        assert_err!(policy.check_authorization(&context(Some("u1"), Some("GUEST"))));
        assert_err!(policy.check_authorization(&context(Some("u1"), None)));
        assert_ok!(policy.check_authorization(&context(Some("u1"), Some("USER"))));
    }

    #[test]
    fn test_block_list_and_allow_list() {
        let policy = policy();
        assert_err!(policy.check_authorization(&context(Some("spammer"), Some("ADMIN"))));
        assert_ok!(policy.check_authorization(&context(Some("vip"), Some("GUEST"))));
        assert_ok!(policy.check_authorization(&context(Some("vip"), None)));
    }

    #[test]
    fn test_banned_word_substring() {
        let policy = policy();
        match policy.check_content("我想去赌博城玩") {
            Err(AdvisorError::ContentPolicy { term }) => assert_eq!(term, "赌博"),
            other => panic!("expected content policy error, got {:?}", other),
        }
        assert_ok!(policy.check_content("我们最近总是吵架"));
    }

    #[test]
    fn test_banned_words_are_case_sensitive() {
        let policy = GuardPolicy::from(&GuardSettings {
            banned_words: vec!["Casino".into()],
            ..GuardSettings::default()
        });
        assert_err!(policy.check_content("the Casino nearby"));
        assert_ok!(policy.check_content("the casino nearby"));
    }

    #[tokio::test]
    async fn test_advisor_rejects_before_model() {
        let advisor = AuthCheckAdvisor::new(Arc::new(policy()));
        assert_eq!(advisor.priority(), 0);

        let guest = PipelineRequest::new("你好").with_context(context(Some("u1"), Some("GUEST")));
        assert!(matches!(
            advisor.before(guest).await,
            Err(AdvisorError::Unauthorized(_))
        ));

        let user = PipelineRequest::new("你好").with_context(context(Some("u1"), Some("USER")));
        let passed = advisor.before(user.clone()).await.unwrap();
        assert_eq!(passed, user);
    }
}
