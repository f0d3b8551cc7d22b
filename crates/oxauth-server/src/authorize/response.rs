//! Authorization response delivery
//!
//! Three modes: `query` appends parameters, `fragment` packs them behind
//! `#`, `form_post` renders the auto-submitting document the adapter
//! returns as HTML. Error responses travel exactly the same way once a
//! redirect URI has been validated.

use oxauth_core::error::ProtocolError;
use oxauth_core::params::ResponseMode;
use url::Url;

/// What the adapter sends back for an authorization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// 303 to this URL (query or fragment already applied).
    Redirect(Url),
    /// 200 with this HTML document.
    FormPost(String),
}

/// Parameters bound for one redirect URI.
#[derive(Debug, Clone)]
pub struct AuthorizationResponse {
    pub redirect_uri: Url,
    pub mode: ResponseMode,
    pub params: Vec<(String, String)>,
}

impl AuthorizationResponse {
    pub fn new(redirect_uri: Url, mode: ResponseMode) -> Self {
        Self {
            redirect_uri,
            mode,
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.push((name.to_owned(), value.into()));
        self
    }

    pub fn param_opt(mut self, name: &str, value: Option<impl Into<String>>) -> Self {
        if let Some(value) = value {
            self.params.push((name.to_owned(), value.into()));
        }
        self
    }

    pub fn error(redirect_uri: Url, mode: ResponseMode, err: &ProtocolError) -> Self {
        Self::new(redirect_uri, mode)
            .param("error", err.code.as_str())
            .param("error_description", err.description.clone())
            .param_opt("error_uri", err.uri.clone())
            .param_opt("state", err.state.clone())
    }

    pub fn deliver(self) -> Delivery {
        match self.mode {
            ResponseMode::Query => {
                let mut url = self.redirect_uri;
                url.query_pairs_mut().extend_pairs(&self.params);
                Delivery::Redirect(url)
            }
            ResponseMode::Fragment => {
                let mut url = self.redirect_uri;
                let encoded = serde_urlencoded::to_string(&self.params)
                    .unwrap_or_default();
                url.set_fragment(Some(&encoded));
                Delivery::Redirect(url)
            }
            ResponseMode::FormPost => Delivery::FormPost(render_form_post(
                self.redirect_uri.as_str(),
                &self.params,
            )),
        }
    }
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn render_form_post(action: &str, params: &[(String, String)]) -> String {
    let mut inputs = String::new();
    for (name, value) in params {
        inputs.push_str(&format!(
            "<input type=\"hidden\" name=\"{}\" value=\"{}\"/>\n",
            escape_html(name),
            escape_html(value)
        ));
    }
    format!(
        "<!DOCTYPE html>\n<html><head><title>Submit this form</title></head>\n\
         <body onload=\"document.forms[0].submit()\">\n\
         <form method=\"post\" action=\"{}\">\n{}</form>\n</body></html>\n",
        escape_html(action),
        inputs
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri() -> Url {
        Url::parse("https://a.example/cb").unwrap()
    }

    #[test]
    fn query_mode_appends_parameters() {
        let delivery = AuthorizationResponse::new(uri(), ResponseMode::Query)
            .param("code", "abc")
            .param("state", "xyz")
            .deliver();
        match delivery {
            Delivery::Redirect(url) => {
                assert_eq!(url.as_str(), "https://a.example/cb?code=abc&state=xyz");
            }
            Delivery::FormPost(_) => panic!("expected redirect"),
        }
    }

    #[test]
    fn fragment_mode_uses_the_hash() {
        let delivery = AuthorizationResponse::new(uri(), ResponseMode::Fragment)
            .param("id_token", "jwt")
            .deliver();
        match delivery {
            Delivery::Redirect(url) => {
                assert_eq!(url.fragment(), Some("id_token=jwt"));
                assert!(url.query().is_none());
            }
            Delivery::FormPost(_) => panic!("expected redirect"),
        }
    }

    #[test]
    fn form_post_escapes_values() {
        let delivery = AuthorizationResponse::new(uri(), ResponseMode::FormPost)
            .param("state", "a\"b<c>")
            .deliver();
        match delivery {
            Delivery::FormPost(html) => {
                assert!(html.contains("a&quot;b&lt;c&gt;"));
                assert!(html.contains("action=\"https://a.example/cb\""));
                assert!(!html.contains("a\"b<c>"));
            }
            Delivery::Redirect(_) => panic!("expected form"),
        }
    }

    #[test]
    fn error_response_carries_the_envelope() {
        let err = ProtocolError::access_denied("the user said no")
            .with_state(Some("xyz".into()));
        let delivery =
            AuthorizationResponse::error(uri(), ResponseMode::Query, &err).deliver();
        match delivery {
            Delivery::Redirect(url) => {
                let query = url.query().unwrap();
                assert!(query.contains("error=access_denied"));
                assert!(query.contains("state=xyz"));
            }
            Delivery::FormPost(_) => panic!("expected redirect"),
        }
    }
}
