//! Cleanup of LLM-generated SQL before execution

use lazy_regex::regex_replace_all;

/// Strip markdown code fences from generated SQL
///
/// Every ```` ``` ```` marker is removed together with a language tag that
/// directly follows it (```` ```sql ````, ```` ```postgresql ````), then the
/// result is trimmed. Text inside the fences is left alone. Applying it
/// twice gives the same result as applying it once.
pub fn clean(sql: &str) -> String {
    regex_replace_all!(r"```[a-zA-Z]*", sql, "").trim().to_string()
}
