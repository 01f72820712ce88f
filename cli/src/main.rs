use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use reqwest::Url;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, SET_COOKIE};
use serde_json::Value;

const SESSION_COOKIE: &str = "harmony_session";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing admin password; pass --password or set HARMONY_PASSWORD")]
    MissingPassword,
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("login succeeded but no session cookie was returned")]
    MissingSessionCookie,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("server returned {status}: {message}")]
    ServerError { status: String, message: String },
    #[error("could not read {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("missing expected field `{0}`")]
    MissingField(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "harmony-cli", about = "Harmony radio admin CLI")]
struct Cli {
    #[arg(long, env = "HARMONY_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "HARMONY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the server is up.
    Ping,
    /// Test the stored Icecast connection settings.
    Verify,
    /// Show station statistics.
    Stats,
    /// List the song library, optionally filtered.
    Songs { query: Option<String> },
    /// Request a song as the admin.
    Request { song_id: String },
    /// Upload an audio file to the Icecast server.
    Upload(UploadArgs),
    AutoDj(AutoDjCommand),
    /// List DJs.
    Djs,
    /// Print the iframe embed code for a widget.
    Embed {
        kind: String,
        #[arg(long)]
        theme: Option<String>,
    },
}

#[derive(Args, Debug)]
struct UploadArgs {
    file: PathBuf,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    artist: Option<String>,
    #[arg(long)]
    album: Option<String>,
}

#[derive(Args, Debug)]
struct AutoDjCommand {
    #[command(subcommand)]
    command: AutoDjSubcommand,
}

#[derive(Subcommand, Debug)]
enum AutoDjSubcommand {
    Status,
    Toggle,
}

struct Session {
    base_url: Url,
    client: reqwest::Client,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let base_url = Url::parse(&cli.base_url).map_err(|e| CliError::InvalidBaseUrl(format!("{}: {e}", cli.base_url)))?;

    if matches!(cli.command, Command::Ping) {
        return run_ping(&base_url).await;
    }

    let password = cli.password.ok_or(CliError::MissingPassword)?;
    let session = login(&base_url, &password).await?;

    match cli.command {
        Command::Ping => Ok(()),
        Command::Verify => {
            let json = session.api(reqwest::Method::POST, &["api", "settings", "icecast", "verify"], &[]).await?;
            print_verification(&json)
        }
        Command::Stats => print_json(&session.api(reqwest::Method::GET, &["api", "stats"], &[]).await?),
        Command::Songs { query } => {
            let query: Vec<(&str, &str)> = query.as_deref().map(|q| ("q", q)).into_iter().collect();
            let json = session.api(reqwest::Method::GET, &["api", "songs"], &query).await?;
            print_songs(&json);
            Ok(())
        }
        Command::Request { song_id } => {
            let json = session.api(reqwest::Method::POST, &["api", "songs", song_id.as_str(), "request"], &[]).await?;
            print_json(&json)
        }
        Command::Upload(args) => run_upload(&session, args).await,
        Command::AutoDj(cmd) => {
            let json = match cmd.command {
                AutoDjSubcommand::Status => session.api(reqwest::Method::GET, &["api", "auto-dj"], &[]).await?,
                AutoDjSubcommand::Toggle => session.api(reqwest::Method::POST, &["api", "auto-dj", "toggle"], &[]).await?,
            };
            let status = json.get("status").and_then(Value::as_str).ok_or(CliError::MissingField("status"))?;
            println!("auto dj {status}");
            Ok(())
        }
        Command::Djs => print_json(&session.api(reqwest::Method::GET, &["api", "djs"], &[]).await?),
        Command::Embed { kind, theme } => {
            let query: Vec<(&str, &str)> = theme.as_deref().map(|t| ("theme", t)).into_iter().collect();
            let json = session.api(reqwest::Method::GET, &["api", "widgets", kind.as_str(), "embed-code"], &query).await?;
            let code = json.get("code").and_then(Value::as_str).ok_or(CliError::MissingField("code"))?;
            println!("{code}");
            Ok(())
        }
    }
}

async fn run_ping(base_url: &Url) -> Result<(), CliError> {
    let response = reqwest::get(endpoint(base_url, &["healthz"])?).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerError {
            status: format!("HTTP {}", status.as_u16()),
            message: "health check failed".to_owned(),
        });
    }
    println!("ok");
    Ok(())
}

/// Log in with the admin password and build a client that replays the session cookie.
async fn login(base_url: &Url, password: &str) -> Result<Session, CliError> {
    let response = reqwest::Client::new()
        .post(endpoint(base_url, &["api", "auth", "login"])?)
        .json(&serde_json::json!({ "password": password }))
        .send()
        .await?;
    let status = response.status();
    let cookie = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(session_cookie_pair);
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    check_status(status, &body)?;

    if body.get("firstLogin").and_then(Value::as_bool) == Some(true) {
        eprintln!("no password was set; this password is now the admin password");
    }

    let mut headers = HeaderMap::new();
    headers.insert(COOKIE, HeaderValue::from_str(&cookie.ok_or(CliError::MissingSessionCookie)?)?);
    let client = reqwest::Client::builder().default_headers(headers).build()?;
    Ok(Session { base_url: base_url.clone(), client })
}

impl Session {
    async fn api(&self, method: reqwest::Method, segments: &[&str], query: &[(&str, &str)]) -> Result<Value, CliError> {
        let response = self
            .client
            .request(method, endpoint(&self.base_url, segments)?)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        let value = response.json::<Value>().await.unwrap_or(Value::Null);
        check_status(status, &value)?;
        Ok(value)
    }
}

async fn run_upload(session: &Session, args: UploadArgs) -> Result<(), CliError> {
    let bytes = tokio::fs::read(&args.file)
        .await
        .map_err(|source| CliError::ReadFile { path: args.file.clone(), source })?;
    let file_name = args
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_owned();
    let mime = mime_guess::from_path(&args.file).first_or_octet_stream();
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(file_name.clone())
        .mime_str(mime.essence_str())?;

    let mut form = reqwest::multipart::Form::new().part("file", part);
    for (name, value) in [("title", args.title), ("artist", args.artist), ("album", args.album)] {
        if let Some(value) = value {
            form = form.text(name, value);
        }
    }

    eprintln!("uploading {file_name}...");
    let response = session
        .client
        .post(endpoint(&session.base_url, &["api", "songs", "upload"])?)
        .multipart(form)
        .send()
        .await?;
    let status = response.status();
    let value = response.json::<Value>().await.unwrap_or(Value::Null);
    check_status(status, &value)?;
    print_json(&value)
}

fn check_status(status: reqwest::StatusCode, body: &Value) -> Result<(), CliError> {
    if status.is_success() {
        return Ok(());
    }
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .map_or_else(|| body.to_string(), str::to_owned);
    Err(CliError::ServerError { status: format!("HTTP {}", status.as_u16()), message })
}

/// `name=value` from a `Set-Cookie` header carrying the session cookie.
fn session_cookie_pair(header: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    (name == SESSION_COOKIE && !value.is_empty()).then(|| pair.to_owned())
}

/// `base` with `segments` appended as percent-encoded path segments.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, CliError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| CliError::InvalidBaseUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn print_verification(value: &Value) -> Result<(), CliError> {
    let success = value.get("success").and_then(Value::as_bool).ok_or(CliError::MissingField("success"))?;
    let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
    println!("{} {message}", if success { "ok:" } else { "failed:" });
    Ok(())
}

fn print_songs(value: &Value) {
    for song in value.as_array().into_iter().flatten() {
        let field = |name: &str| song.get(name).and_then(Value::as_str).unwrap_or_default();
        let secs = song.get("duration").and_then(Value::as_u64).unwrap_or_default();
        println!("{:<10} {:<32} {:<24} {}:{:02}", field("id"), field("title"), field("artist"), secs / 60, secs % 60);
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_pair_picks_session_cookie() {
        assert_eq!(
            session_cookie_pair("harmony_session=abc123; Path=/; HttpOnly").as_deref(),
            Some("harmony_session=abc123")
        );
        assert_eq!(session_cookie_pair("other=1; Path=/"), None);
        assert_eq!(session_cookie_pair("harmony_session=; Max-Age=0"), None);
    }

    #[test]
    fn endpoint_appends_encoded_segments() {
        let base = Url::parse("http://127.0.0.1:3000").unwrap();
        assert_eq!(endpoint(&base, &["api", "stats"]).unwrap().as_str(), "http://127.0.0.1:3000/api/stats");
        assert_eq!(
            endpoint(&base, &["api", "songs", "a b/c", "request"]).unwrap().as_str(),
            "http://127.0.0.1:3000/api/songs/a%20b%2Fc/request"
        );

        let nested = Url::parse("https://radio.example.com/harmony/").unwrap();
        assert_eq!(endpoint(&nested, &["healthz"]).unwrap().as_str(), "https://radio.example.com/harmony/healthz");
    }

    #[test]
    fn endpoint_rejects_opaque_base() {
        let base = Url::parse("mailto:dj@example.com").unwrap();
        assert!(matches!(endpoint(&base, &["api"]), Err(CliError::InvalidBaseUrl(_))));
    }

    #[test]
    fn upload_mime_comes_from_extension() {
        let mime = |name: &str| mime_guess::from_path(name).first_or_octet_stream();
        assert_eq!(mime("Track.MP3").essence_str(), "audio/mpeg");
        assert_eq!(mime("mix.flac").type_(), mime_guess::mime::AUDIO);
        assert_eq!(mime("notes").essence_str(), "application/octet-stream");
    }

    #[test]
    fn verification_needs_success_flag() {
        let ok = serde_json::json!({ "success": true, "message": "Successfully connected to Icecast server via HTTP!" });
        assert!(print_verification(&ok).is_ok());
        let missing = serde_json::json!({ "message": "no flag" });
        assert!(matches!(print_verification(&missing), Err(CliError::MissingField("success"))));
    }

    #[test]
    fn check_status_surfaces_error_message() {
        let body = serde_json::json!({ "error": "Invalid password" });
        let err = check_status(reqwest::StatusCode::UNAUTHORIZED, &body).unwrap_err();
        assert_eq!(err.to_string(), "server returned HTTP 401: Invalid password");
        assert!(check_status(reqwest::StatusCode::OK, &Value::Null).is_ok());
    }
}
