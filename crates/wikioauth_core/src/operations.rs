use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::DEFAULT_MAX_CONTRIBUTIONS;
use crate::error::SessionError;
use crate::session::{SessionSource, WikiApi};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfoRecord {
    pub name: String,
    pub edit_count: u64,
    pub registration_time: Option<String>,
    pub groups: Vec<String>,
}

impl UserInfoRecord {
    fn defaults(name: String) -> Self {
        Self {
            name,
            edit_count: 0,
            registration_time: None,
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContributionRecord {
    pub title: String,
    pub revision_id: Option<u64>,
    pub timestamp: Option<String>,
    pub comment: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageContentRecord {
    pub title: String,
    pub exists: bool,
    pub text: String,
    pub revision_id: Option<u64>,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditResult {
    pub success: bool,
    pub error: Option<String>,
    pub revision_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub username: String,
    pub edit_count: u64,
    pub groups: Vec<String>,
    pub has_oauth: bool,
}

/// Read/write operations performed on behalf of one user. Every call opens
/// its own session and drops it before returning.
pub struct UserWiki<S> {
    source: S,
    max_contributions: usize,
}

impl<S: SessionSource> UserWiki<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            max_contributions: DEFAULT_MAX_CONTRIBUTIONS,
        }
    }

    pub fn with_max_contributions(mut self, max_contributions: usize) -> Self {
        self.max_contributions = max_contributions.max(1);
        self
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    /// Remote and transport failures degrade to default values; credential
    /// and configuration failures propagate.
    pub fn fetch_user_info(&self, identity: &str) -> Result<UserInfoRecord, SessionError> {
        let mut session = self.source.open_session(identity)?;
        let fallback_name = fallback_name(&session);
        let response = match session.get(&[
            ("action", "query".to_string()),
            ("meta", "userinfo".to_string()),
            ("uiprop", "editcount|registration|groups".to_string()),
        ]) {
            Ok(response) => response,
            Err(error) if error.is_remote_failure() => {
                warn!(
                    identity,
                    category = error.category(),
                    "user info lookup failed, returning defaults: {error}"
                );
                return Ok(UserInfoRecord::defaults(fallback_name));
            }
            Err(error) => return Err(error),
        };
        Ok(parse_user_info(&response, &fallback_name))
    }

    pub fn fetch_contributions(
        &self,
        identity: &str,
        limit: usize,
    ) -> Result<Vec<ContributionRecord>, SessionError> {
        let limit = limit.clamp(1, self.max_contributions);
        let mut session = self.source.open_session(identity)?;
        let username = resolve_username(&mut session)?;

        let response = session.get(&[
            ("action", "query".to_string()),
            ("list", "usercontribs".to_string()),
            ("ucuser", username),
            ("uclimit", limit.to_string()),
            ("ucprop", "title|ids|timestamp|comment|size".to_string()),
        ])?;
        parse_contributions(&response)
    }

    pub fn fetch_page_content(
        &self,
        identity: &str,
        page_title: &str,
    ) -> Result<PageContentRecord, SessionError> {
        let mut session = self.source.open_session(identity)?;
        let response = session.get(&[
            ("action", "query".to_string()),
            ("titles", page_title.to_string()),
            ("prop", "revisions|info".to_string()),
            ("rvprop", "content|ids".to_string()),
            ("rvslots", "main".to_string()),
        ])?;
        parse_page_content(&response, page_title)
    }

    /// Never fails: every error is reported through [`EditResult::error`].
    pub fn submit_edit(
        &self,
        identity: &str,
        page_title: &str,
        new_text: &str,
        summary: &str,
    ) -> EditResult {
        match self.try_edit(identity, page_title, new_text, summary) {
            Ok(revision_id) => {
                info!(identity, page_title, ?revision_id, "edit saved");
                EditResult {
                    success: true,
                    error: None,
                    revision_id,
                }
            }
            Err(error) => {
                warn!(
                    identity,
                    page_title,
                    category = error.category(),
                    "edit failed: {error}"
                );
                EditResult {
                    success: false,
                    error: Some(render_edit_error(&error)),
                    revision_id: None,
                }
            }
        }
    }

    /// Missing credentials propagate; any other failure falls back to a
    /// default profile.
    pub fn fetch_profile(&self, identity: &str) -> Result<UserProfile, SessionError> {
        let info = match self.fetch_user_info(identity) {
            Ok(info) => info,
            Err(error @ SessionError::CredentialNotFound { .. }) => return Err(error),
            Err(error) => {
                warn!(
                    identity,
                    category = error.category(),
                    "profile lookup failed, returning defaults: {error}"
                );
                UserInfoRecord::defaults(identity.to_string())
            }
        };
        Ok(UserProfile {
            username: info.name,
            edit_count: info.edit_count,
            groups: info.groups,
            has_oauth: true,
        })
    }

    fn try_edit(
        &self,
        identity: &str,
        page_title: &str,
        new_text: &str,
        summary: &str,
    ) -> Result<Option<u64>, SessionError> {
        let mut session = self.source.open_session(identity)?;
        let token = session.csrf_token()?;
        let response = session.post(&[
            ("action", "edit".to_string()),
            ("title", page_title.to_string()),
            ("text", new_text.to_string()),
            ("summary", summary.to_string()),
            ("token", token),
        ])?;
        parse_edit_response(&response)
    }
}

fn fallback_name<W: WikiApi>(session: &W) -> String {
    session
        .cached_username()
        .unwrap_or(session.identity())
        .to_string()
}

fn resolve_username<W: WikiApi>(session: &mut W) -> Result<String, SessionError> {
    let response = session.get(&[
        ("action", "query".to_string()),
        ("meta", "userinfo".to_string()),
    ])?;
    if let Some(name) = registered_userinfo(&response)
        .and_then(|userinfo| userinfo.get("name"))
        .and_then(Value::as_str)
        .filter(|name| !name.trim().is_empty())
    {
        return Ok(name.to_string());
    }
    session
        .cached_username()
        .map(ToString::to_string)
        .ok_or_else(|| {
            SessionError::remote(
                "nouser",
                format!("could not determine wiki username for {}", session.identity()),
            )
        })
}

/// `query.userinfo` unless it is absent or describes an anonymous user.
fn registered_userinfo(response: &Value) -> Option<&Value> {
    let userinfo = response.get("query")?.get("userinfo")?;
    if !userinfo.is_object() || userinfo.get("anon").is_some_and(|anon| anon != &Value::Bool(false)) {
        return None;
    }
    Some(userinfo)
}

pub fn parse_user_info(response: &Value, fallback_name: &str) -> UserInfoRecord {
    let Some(userinfo) = registered_userinfo(response) else {
        return UserInfoRecord::defaults(fallback_name.to_string());
    };
    UserInfoRecord {
        name: userinfo
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(fallback_name)
            .to_string(),
        edit_count: userinfo.get("editcount").and_then(Value::as_u64).unwrap_or(0),
        registration_time: userinfo
            .get("registration")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        groups: userinfo
            .get("groups")
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

pub fn parse_contributions(response: &Value) -> Result<Vec<ContributionRecord>, SessionError> {
    let entries = response
        .get("query")
        .and_then(|query| query.get("usercontribs"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            SessionError::Transport("contributions response has no `query.usercontribs` list".to_string())
        })?;

    Ok(entries
        .iter()
        .map(|entry| ContributionRecord {
            title: entry
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            revision_id: entry.get("revid").and_then(Value::as_u64),
            timestamp: entry
                .get("timestamp")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            comment: entry
                .get("comment")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            size: entry.get("size").and_then(Value::as_u64).unwrap_or(0),
        })
        .collect())
}

/// A page flagged `missing` or `invalid` is a normal `exists: false`
/// record; a response without any page entry is a transport failure.
pub fn parse_page_content(
    response: &Value,
    requested_title: &str,
) -> Result<PageContentRecord, SessionError> {
    let pages = response.get("query").and_then(|query| query.get("pages"));
    let first = match pages {
        Some(Value::Array(pages)) => pages.first(),
        Some(Value::Object(pages)) => pages.values().next(),
        _ => None,
    };
    let page = first.filter(|page| page.is_object()).ok_or_else(|| {
        SessionError::Transport(format!(
            "page response for {requested_title:?} has no `query.pages` entry"
        ))
    })?;
    let title = page
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(requested_title)
        .to_string();

    if !page_exists(page) {
        return Ok(PageContentRecord {
            title,
            exists: false,
            text: String::new(),
            revision_id: None,
            length: 0,
        });
    }

    let revision = page
        .get("revisions")
        .and_then(Value::as_array)
        .and_then(|revisions| revisions.first());
    let text = revision
        .and_then(|revision| {
            revision
                .get("slots")
                .and_then(|slots| slots.get("main"))
                .and_then(|main| main.get("content").or_else(|| main.get("*")))
                .or_else(|| revision.get("content"))
                .or_else(|| revision.get("*"))
        })
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let revision_id = revision
        .and_then(|revision| revision.get("revid"))
        .or_else(|| page.get("lastrevid"))
        .and_then(Value::as_u64);

    Ok(PageContentRecord {
        title,
        exists: true,
        length: page
            .get("length")
            .and_then(Value::as_u64)
            .unwrap_or(text.len() as u64),
        text,
        revision_id,
    })
}

fn page_exists(page: &Value) -> bool {
    let flagged = |key: &str| {
        page.get(key)
            .is_some_and(|value| value != &Value::Bool(false))
    };
    !flagged("missing") && !flagged("invalid")
}

/// `Some(revid)` for a saved edit, `None` for a no-op edit.
pub fn parse_edit_response(response: &Value) -> Result<Option<u64>, SessionError> {
    let edit = response
        .get("edit")
        .ok_or_else(|| SessionError::Transport("edit response has no `edit` object".to_string()))?;
    let result = edit
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    if !result.eq_ignore_ascii_case("success") {
        return Err(SessionError::remote(
            result.to_ascii_lowercase(),
            edit_failure_info(edit, result),
        ));
    }
    Ok(edit.get("newrevid").and_then(Value::as_u64))
}

/// Human-readable reason for a non-`Success` edit result.
fn edit_failure_info(edit: &Value, result: &str) -> String {
    if let Some(info) = edit
        .get("info")
        .and_then(Value::as_str)
        .filter(|info| !info.trim().is_empty())
    {
        return info.to_string();
    }
    if edit.get("captcha").is_some() {
        return "edit requires solving a CAPTCHA".to_string();
    }
    if let Some(filter) = edit
        .get("abusefilter")
        .and_then(|filter| filter.get("description"))
        .and_then(Value::as_str)
    {
        return format!("edit blocked by abuse filter: {filter}");
    }
    if let Some(spam) = edit.get("spamblacklist").and_then(Value::as_str) {
        return format!("edit blocked by spam blacklist: {spam}");
    }
    format!("edit was not saved (result: {result})")
}

pub fn render_edit_error(error: &SessionError) -> String {
    match error {
        SessionError::RemoteApi { code, info } => format!("API Error: {code} - {info}"),
        other => format!("Error making edit: {other}"),
    }
}
