/// Values substituted into prompt and command templates.
///
/// Unknown `{{...}}` tokens are left verbatim; the caller controls the
/// template, so no escaping is performed.
#[derive(Clone, Debug, Default)]
pub struct TemplateContext {
    pub body: String,
    pub body_stripped: String,
    pub from: String,
    pub to: String,
    pub message_sid: String,
    pub session_id: String,
    pub is_new_session: bool,
    pub media_path: Option<String>,
}

pub fn apply(template: &str, ctx: &TemplateContext) -> String {
    template
        .replace("{{Body}}", &ctx.body)
        .replace("{{BodyStripped}}", &ctx.body_stripped)
        .replace("{{From}}", &ctx.from)
        .replace("{{To}}", &ctx.to)
        .replace("{{MessageSid}}", &ctx.message_sid)
        .replace("{{SessionId}}", &ctx.session_id)
        .replace(
            "{{IsNewSession}}",
            if ctx.is_new_session { "true" } else { "false" },
        )
        .replace("{{MediaPath}}", ctx.media_path.as_deref().unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext {
            body: "hello".to_string(),
            body_stripped: "hello".to_string(),
            from: "+1".to_string(),
            to: "+2".to_string(),
            message_sid: "SM1".to_string(),
            session_id: "abc123".to_string(),
            is_new_session: true,
            media_path: None,
        }
    }

    #[test]
    fn substitutes_known_tokens() {
        let out = apply("{{From}} says {{Body}} in {{SessionId}}", &ctx());
        assert_eq!(out, "+1 says hello in abc123");
    }

    #[test]
    fn renders_booleans_and_missing_media() {
        let out = apply("new={{IsNewSession}} media={{MediaPath}}", &ctx());
        assert_eq!(out, "new=true media=");
    }

    #[test]
    fn leaves_unknown_tokens_verbatim() {
        let out = apply("{{Body}} {{Nope}}", &ctx());
        assert_eq!(out, "hello {{Nope}}");
    }
}
