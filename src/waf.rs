//! The Web Application Firewall: clearance-cookie verification, CAPTCHA
//! challenge issuance and verification, and the user-agent policy filter.
//!
//! Checks run in a fixed order: a valid clearance cookie allows the
//! request outright; a CAPTCHA submission is verified against the
//! provider and, on success, replays the originally sealed request; only
//! then does the policy filter consult the configured user-agent rules.
//! Policy hits close the connection without a response so probing clients
//! cannot distinguish policy from genuine errors.

use crate::prelude::*;
use crate::{minify, parse, seal};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// The clearance cookie name.
pub const CLEARANCE_COOKIE: &str = "iridium_clearance";
/// Clearance cookie lifetime in seconds.
pub const CLEARANCE_MAX_AGE: i64 = 30 * 60;

macro_rules! regexes {
    ($($pattern:literal),+ $(,)?) => {
        // unwrap is ok; the patterns are fixed and known-valid
        vec![$(Regex::new($pattern).unwrap()),+]
    };
}

/// User agents of HTTP libraries and API tools.
static LIBRARY_AGENTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    regexes![
        r"^Bun/\d+\.\d+\.\d+",
        r"^Insomnia/\d+\.\d+\.\d+",
        r"^PostmanRuntime/\d+\.\d+\.\d+",
        r"^Go-http-client/\d+\.\d+",
        r"^curl/\d+\.\d+\.\d+",
        r"^Wget/\d+\.\d+\.\d+",
        r"^axios/\d+\.\d+\.\d+",
        r"^httpx/\d+\.\d+\.\d+",
        r"^python-requests/\d+\.\d+(\.\d+)?",
        r"^Java/\d+\.\d+",
        r"^PHP/\d+\.\d+(\.\d+)?",
        r"^libwww-perl/\d+\.\d+",
    ]
});

/// User agents of search-engine and social crawlers.
static CRAWLER_AGENTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    regexes![
        r"Googlebot/\d+\.\d+ \(\+http://www\.google\.com/bot\.html\)",
        r"bingbot/\d+\.\d+",
        r"Baiduspider/\d+\.\d+",
        r"YandexBot/\d+\.\d+",
        r"DuckDuckBot/\d+\.\d+",
        r"facebookexternalhit/\d+\.\d+",
        r"Twitterbot/\d+\.\d+",
    ]
});

/// The outcome of the WAF checks for one request.
#[derive(Debug)]
#[must_use]
pub enum Verdict {
    /// Serve the request normally.
    Allow,
    /// Refuse the request. With `close` the connection is dropped without
    /// a response byte; otherwise the dispatcher answers 403 (with the
    /// challenge page when a CAPTCHA is configured). The reason is
    /// logged, never sent.
    Block {
        /// Drop the connection without any response.
        close: bool,
        /// Logged reason for the block.
        reason: Option<String>,
    },
    /// The client has no clearance; serve the CAPTCHA challenge page.
    Challenge,
    /// A CAPTCHA was solved: serve `request` (the sealed original,
    /// restored) and set `token` as the clearance cookie.
    AllowReplay {
        /// The restored original request.
        request: Request,
        /// Freshly minted clearance token.
        token: String,
    },
}

/// Payload of a clearance cookie, bound to the client identity.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearanceToken {
    /// `user-agent` at mint time.
    pub user_agent: String,
    /// `x-forwarded-for` at mint time.
    pub ip: String,
    /// `accept-language` at mint time.
    pub accept_language: String,
    /// `accept-encoding` at mint time.
    pub accept_encoding: String,
}

/// The sealed original request carried through a CAPTCHA round-trip.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeData {
    /// Original method token.
    pub method: String,
    /// Original target path.
    pub path: String,
    /// Base64 of the JSON-encoded original headers.
    pub headers: String,
    /// Original body.
    pub body: String,
    /// The provider the challenge was issued for.
    pub captcha_provider: String,
    /// Client address the challenge was issued to.
    pub ip: String,
    /// Client user agent the challenge was issued to.
    pub user_agent: String,
    /// Authority the challenge was issued under.
    pub host: String,
}

/// Runs the WAF over `request`. See the module docs for the ordering.
pub async fn check(
    request: &Request,
    config: &Config,
    key: &seal::Key,
    logs: &crate::logging::Logs,
) -> Verdict {
    // 1: a clearance cookie bound to this client allows outright
    if let Some(cookie_header) = request.header("cookie") {
        if let Some(token) = parse::cookies(cookie_header).get(CLEARANCE_COOKIE) {
            if let Ok(clearance) = key.open_json::<ClearanceToken>(token) {
                let user_agent = request.header("user-agent").unwrap_or("");
                let forwarded_for = request.header("x-forwarded-for").unwrap_or("");
                if clearance.user_agent == user_agent && clearance.ip == forwarded_for {
                    debug!("Valid clearance token, allowing request");
                    return Verdict::Allow;
                }
            }
            // an invalid token proceeds to the remaining checks
        }
    }

    // 2: a CAPTCHA submission is verified against the provider
    if request.method == Method::POST
        && request
            .header("content-type")
            .is_some_and(|ct| ct == "application/x-www-form-urlencoded")
    {
        let body = String::from_utf8_lossy(&request.body).into_owned();
        if body.contains("response=") && body.contains("data=") {
            let form = parse::form(&body);
            if let Some(verdict) = check_submission(request, &form, config, key, logs).await {
                return verdict;
            }
        }
    }

    // 3: the policy filter
    policy(request, config, logs)
}

async fn check_submission(
    request: &Request,
    form: &HashMap<String, String>,
    config: &Config,
    key: &seal::Key,
    logs: &crate::logging::Logs,
) -> Option<Verdict> {
    let block = |reason: &str| {
        Some(Verdict::Block {
            close: false,
            reason: Some(reason.to_string()),
        })
    };

    let data = form.get("data").map(String::as_str).unwrap_or("");
    let sealed: ChallengeData = match key.open_json(data) {
        Ok(sealed) => sealed,
        Err(err) => {
            // likely not a CAPTCHA submission at all; keep processing
            logs.waf(&format!("Error decoding CAPTCHA request data: {err}"));
            return None;
        }
    };

    let user_agent = request.header("user-agent").unwrap_or("");
    if user_agent != sealed.user_agent || request.path != sealed.path {
        logs.waf(&format!(
            "CAPTCHA request data does not match original request from IP {}",
            sealed.ip
        ));
        return block("captcha data mismatch");
    }

    let response_field = match sealed.captcha_provider.as_str() {
        "hcaptcha" => "h-captcha-response",
        "recaptcha" => "g-recaptcha-response",
        "turnstile" => "cf-turnstile-response",
        other => {
            logs.waf(&format!(
                "Unsupported CAPTCHA provider in request from IP {}: {other}",
                sealed.ip
            ));
            return block("unsupported captcha provider");
        }
    };
    let solution = form.get(response_field).map(String::as_str).unwrap_or("");

    let secret = &config.waf.captcha.secret_key;
    if secret.is_empty() || secret == "your-secret-key" {
        logs.error("captcha secret key is not configured");
        return block("captcha not configured");
    }

    if !verify_solution(solution, &sealed.captcha_provider, secret).await {
        logs.waf(&format!(
            "Invalid CAPTCHA solution from IP {} using {}",
            sealed.ip, sealed.captcha_provider
        ));
        return block("invalid captcha");
    }
    logs.waf(&format!(
        "Successful CAPTCHA solution from IP {} using {}",
        sealed.ip, sealed.captcha_provider
    ));

    // restore the sealed original request
    let Some(headers) = BASE64
        .decode(&sealed.headers)
        .ok()
        .and_then(|json| serde_json::from_slice::<HashMap<String, String>>(&json).ok())
    else {
        logs.waf(&format!(
            "Error decoding CAPTCHA request headers from IP {}",
            sealed.ip
        ));
        return block("captcha headers error");
    };

    let mut replay = request.clone();
    replay.method = Method::from_bytes(sealed.method.as_bytes()).unwrap_or(Method::GET);
    replay.path = sealed.path.clone();
    replay.body = Bytes::from(sealed.body.into_bytes());
    replay.headers = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            replay.headers.insert(name, value);
        }
    }

    let token = match clearance_token(key, &replay.headers) {
        Ok(token) => token,
        Err(err) => {
            logs.error(format!("error sealing clearance token: {err}"));
            return block("captcha headers error");
        }
    };
    logs.waf(&format!("Passed CAPTCHA, allowing request from IP {}", sealed.ip));
    Some(Verdict::AllowReplay {
        request: replay,
        token,
    })
}

fn policy(request: &Request, config: &Config, logs: &crate::logging::Logs) -> Verdict {
    if !config.waf.enabled {
        return Verdict::Allow;
    }
    let block = |reason: &str| Verdict::Block {
        close: true,
        reason: Some(reason.to_string()),
    };

    let user_agent = request.header("user-agent").unwrap_or("");
    if config.waf.block_empty_ua && user_agent.trim().is_empty() {
        logs.waf("Blocked request with empty User-Agent");
        return block("empty User-Agent");
    }
    if config.waf.block_libraries && LIBRARY_AGENTS.iter().any(|re| re.is_match(user_agent)) {
        logs.waf(&format!(
            "Blocked request with library/tool User-Agent: {user_agent}"
        ));
        return block("library/tool User-Agent");
    }
    if config.waf.block_crawlers && CRAWLER_AGENTS.iter().any(|re| re.is_match(user_agent)) {
        logs.waf(&format!(
            "Blocked request with crawler/bot User-Agent: {user_agent}"
        ));
        return block("crawler/bot User-Agent");
    }

    // unverified clients are challenged when a CAPTCHA is configured
    if config.waf.captcha.enabled {
        return Verdict::Challenge;
    }
    Verdict::Allow
}

/// Mints a clearance token bound to the client identity headers.
///
/// # Errors
///
/// Passes errors from [`seal::Key::seal_json`].
pub fn clearance_token(key: &seal::Key, headers: &HeaderMap) -> Result<String, seal::Error> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    key.seal_json(&ClearanceToken {
        user_agent: get("user-agent"),
        ip: get("x-forwarded-for"),
        accept_language: get("accept-language"),
        accept_encoding: get("accept-encoding"),
    })
}

/// Sends `solution` to the provider's `siteverify` endpoint. Any
/// transport or decoding failure counts as an unsolved challenge.
pub async fn verify_solution(solution: &str, provider: &str, secret: &str) -> bool {
    let url = match provider {
        "hcaptcha" => "https://hcaptcha.com/siteverify",
        "recaptcha" => "https://www.google.com/recaptcha/api/siteverify",
        "turnstile" => "https://challenges.cloudflare.com/turnstile/v0/siteverify",
        _ => return false,
    };

    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct Verify {
        success: bool,
    }

    let body = format!("response={solution}&secret={secret}");
    let response = reqwest::Client::new()
        .post(url)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await;
    match response {
        Ok(response) => match response.json::<Verify>().await {
            Ok(verify) => verify.success,
            Err(err) => {
                warn!("Error decoding {provider} verification response: {err}");
                false
            }
        },
        Err(err) => {
            warn!("Error sending {provider} verification request: {err}");
            false
        }
    }
}

/// Renders the minified CAPTCHA challenge page for `request`, embedding
/// the sealed original request in a hidden `data` field. Served with 403.
///
/// # Errors
///
/// Passes errors from sealing the challenge data.
pub fn challenge_page(
    request: &Request,
    client_ip: &str,
    host: &str,
    config: &Config,
    key: &seal::Key,
) -> Result<String, seal::Error> {
    let site_key = &config.waf.captcha.site_key;
    let (script_url, widget) = match config.waf.captcha.provider.as_str() {
        "hcaptcha" => (
            "https://hcaptcha.com/1/api.js",
            format!(
                r#"<div class="h-captcha" data-sitekey="{site_key}" data-callback="onSubmit" data-theme="dark"></div>"#
            ),
        ),
        "recaptcha" => (
            "https://www.google.com/recaptcha/api.js",
            format!(
                r#"<div class="g-recaptcha" data-sitekey="{site_key}" data-callback="onSubmit"></div>"#
            ),
        ),
        "turnstile" => (
            "https://challenges.cloudflare.com/turnstile/v0/api.js",
            format!(
                r#"<div class="cf-turnstile" data-sitekey="{site_key}" data-callback="onSubmit" data-theme="dark"></div>"#
            ),
        ),
        _ => ("", String::new()),
    };

    let headers: HashMap<&str, &str> = request
        .headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .collect();
    // unwrap is ok; a map of strings always serialises
    let headers = BASE64.encode(serde_json::to_vec(&headers).unwrap());

    let data = ChallengeData {
        method: request.method.to_string(),
        path: request.path.clone(),
        headers,
        body: String::from_utf8_lossy(&request.body).into_owned(),
        captcha_provider: config.waf.captcha.provider.clone(),
        ip: client_ip.to_string(),
        user_agent: request.header("user-agent").unwrap_or("").to_string(),
        host: host.to_string(),
    };
    let sealed = key.seal_json(&data)?;

    let style = minify::css(
        "\n\t  body {\n\t\tfont-family: Segoe UI, system-ui, -apple-system, BlinkMacSystemFont, Roboto, Helvetica Neue, Arial, sans-serif;\n\t\tdisplay: flex;\n\t\tflex-direction: column;\n\t\talign-items: center;\n\t\tjustify-content: center;\n\t\theight: 100vh;\n\t\tmargin: 0;\n\t\tbackground: #1b2123;\n\t\tcolor: #ffffff;\n\t  }\n\t  .container {\n\t\ttext-align: center;\n\t\tdisplay: flex;\n\t\tflex-direction: column;\n\t\talign-items: center;\n\t\tjustify-content: center;\n\t  }\n\t  h1 {\n\t\tmargin-bottom: 20px;\n\t  }",
    );
    let script = minify::js(
        "\nwindow.onSubmit = (token) => {\n  const form = document.querySelector('form');\n  form.submit();\n  form.innerHTML = 'Waiting for '+window.location.hostname+' to respond...';\n}",
    );

    Ok(minify::html(&format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
	<meta charset="UTF-8" />
	<meta name="viewport" content="width=device-width, initial-scale=1.0" />
	<title>Captcha Verification</title>
	<script src="{script_url}" async defer></script>
	<style>{style}</style>
  </head>
  <body>
	<div class="container">
	  <h1>Please complete the CAPTCHA to continue to the site</h1>
	  <form method="POST">{widget}<input type="hidden" name="data" value="{sealed}" /></form>
	</div>
<div>
<p>Security &amp; protection by <a href="https://github.com/IridiumProxy/iridium" target="_blank" style="color: #4ea1f3;">Iridium</a></p>
</div>
<script>{script}</script>
</body>
</html>"#
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Logs;

    fn test_logs() -> Logs {
        let dir = std::env::temp_dir().join(format!(
            "iridium-waf-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        Logs::open(&dir, &crate::config::LoggingConfig::default()).unwrap()
    }

    fn waf_config(captcha: bool) -> Config {
        let mut config = Config::default();
        config.waf.enabled = true;
        config.waf.captcha.enabled = captcha;
        config.waf.captcha.site_key = "site".into();
        config
    }

    fn request_with(user_agent: &str, forwarded_for: &str) -> Request {
        let mut request = Request::empty();
        if !user_agent.is_empty() {
            request
                .headers
                .insert("user-agent", HeaderValue::from_str(user_agent).unwrap());
        }
        if !forwarded_for.is_empty() {
            request.headers.insert(
                "x-forwarded-for",
                HeaderValue::from_str(forwarded_for).unwrap(),
            );
        }
        request
    }

    #[tokio::test]
    async fn policy_blocks_libraries_with_reset() {
        let logs = test_logs();
        let key = seal::Key::resolve(Some("k"));
        let request = request_with("curl/8.4.0", "");
        match check(&request, &waf_config(false), &key, &logs).await {
            Verdict::Block { close: true, reason } => {
                assert_eq!(reason.as_deref(), Some("library/tool User-Agent"));
            }
            verdict => panic!("unexpected verdict {verdict:?}"),
        }
    }

    #[tokio::test]
    async fn policy_blocks_crawlers_and_empty_ua() {
        let logs = test_logs();
        let key = seal::Key::resolve(Some("k"));
        let bot = request_with("Mozilla/5.0 (compatible; bingbot/2.0)", "");
        assert!(matches!(
            check(&bot, &waf_config(false), &key, &logs).await,
            Verdict::Block { close: true, .. }
        ));
        let empty = request_with("", "");
        assert!(matches!(
            check(&empty, &waf_config(false), &key, &logs).await,
            Verdict::Block { close: true, .. }
        ));
    }

    #[tokio::test]
    async fn disabled_waf_allows_everyone() {
        let logs = test_logs();
        let key = seal::Key::resolve(Some("k"));
        let request = request_with("curl/8.4.0", "");
        assert!(matches!(
            check(&request, &Config::default(), &key, &logs).await,
            Verdict::Allow
        ));
    }

    #[tokio::test]
    async fn browsers_are_challenged_when_captcha_is_on() {
        let logs = test_logs();
        let key = seal::Key::resolve(Some("k"));
        let request = request_with("Mozilla/5.0 (X11; Linux x86_64)", "");
        assert!(matches!(
            check(&request, &waf_config(true), &key, &logs).await,
            Verdict::Challenge
        ));
        assert!(matches!(
            check(&request, &waf_config(false), &key, &logs).await,
            Verdict::Allow
        ));
    }

    #[tokio::test]
    async fn clearance_binds_user_agent_and_ip() {
        let logs = test_logs();
        let key = seal::Key::resolve(Some("k"));
        let config = waf_config(true);

        let minted = request_with("Mozilla/5.0", "1.2.3.4");
        let token = clearance_token(&key, &minted.headers).unwrap();
        let cookie = format!("{CLEARANCE_COOKIE}={token}");

        let mut cleared = request_with("Mozilla/5.0", "1.2.3.4");
        cleared
            .headers
            .insert("cookie", HeaderValue::from_str(&cookie).unwrap());
        assert!(matches!(
            check(&cleared, &config, &key, &logs).await,
            Verdict::Allow
        ));

        let mut wrong_agent = request_with("Chrome/120.0", "1.2.3.4");
        wrong_agent
            .headers
            .insert("cookie", HeaderValue::from_str(&cookie).unwrap());
        assert!(matches!(
            check(&wrong_agent, &config, &key, &logs).await,
            Verdict::Challenge
        ));

        let mut wrong_ip = request_with("Mozilla/5.0", "5.6.7.8");
        wrong_ip
            .headers
            .insert("cookie", HeaderValue::from_str(&cookie).unwrap());
        assert!(matches!(
            check(&wrong_ip, &config, &key, &logs).await,
            Verdict::Challenge
        ));
    }

    #[tokio::test]
    async fn submission_with_mismatched_data_is_blocked() {
        let logs = test_logs();
        let key = seal::Key::resolve(Some("k"));
        let config = waf_config(true);

        let sealed = key
            .seal_json(&ChallengeData {
                path: "/original".into(),
                user_agent: "Mozilla/5.0".into(),
                captcha_provider: "hcaptcha".into(),
                ..ChallengeData::default()
            })
            .unwrap();

        let mut request = request_with("Mozilla/5.0", "");
        request.method = Method::POST;
        request.path = "/other".into();
        request.headers.insert(
            "content-type",
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let encoded: String = sealed
            .chars()
            .map(|c| match c {
                '+' => "%2B".to_string(),
                '=' => "%3D".to_string(),
                '/' => "%2F".to_string(),
                c => c.to_string(),
            })
            .collect();
        request.body = Bytes::from(format!("h-captcha-response=tok&response=tok&data={encoded}"));

        match check(&request, &config, &key, &logs).await {
            Verdict::Block { close: false, reason } => {
                assert_eq!(reason.as_deref(), Some("captcha data mismatch"));
            }
            verdict => panic!("unexpected verdict {verdict:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_submission_falls_through_to_policy() {
        let logs = test_logs();
        let key = seal::Key::resolve(Some("k"));
        let mut request = request_with("Mozilla/5.0", "");
        request.method = Method::POST;
        request.headers.insert(
            "content-type",
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        request.body = Bytes::from_static(b"response=x&data=garbage");
        assert!(matches!(
            check(&request, &waf_config(false), &key, &logs).await,
            Verdict::Allow
        ));
    }

    #[test]
    fn challenge_page_embeds_the_widget() {
        let key = seal::Key::resolve(Some("k"));
        let request = request_with("Mozilla/5.0", "");
        let page =
            challenge_page(&request, "1.2.3.4", "example.com", &waf_config(true), &key).unwrap();
        assert!(page.contains("h-captcha"));
        assert!(page.contains("data-sitekey=\"site\""));
        assert!(page.contains("name=\"data\""));
        assert!(page.contains("hcaptcha.com/1/api.js"));
        assert!(!page.contains('\n'));
    }
}
