use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use crossbeam_channel::{select, tick, unbounded, Receiver};
use indicatif::{ProgressBar, ProgressStyle};
use textwrap::{wrap, Options as WrapOptions};

use crate::compose::{Attachment, ComposeError, Draft, PostComposer};
use crate::config::{self, BackendKind, Config, PlayerConfig};
use crate::feed::{FeedPager, LoadMode, PageEvent, PagerConfig};
use crate::firebase::{
    Endpoints, FirebaseBlobStore, FirebaseConfig, FirebaseIdentity, FirestoreStore,
};
use crate::identity::{IdentityProvider, LocalIdentity, OAuthProvider};
use crate::model::{relative_time, MediaKind, Post, User};
use crate::oauth;
use crate::playback::{MpvPlayer, VideoGate};
use crate::profile::Profiles;
use crate::session::{login_failure_message, Session};
use crate::storage::{self, StateStore};
use crate::store::{BlobStore, DocumentStore, MemoryStore};
use crate::viewport::{Bounds, ScrollRegion, Threshold, ViewportTrigger};

pub const USAGE: &str = "socialfeed - a small social feed for the terminal

Usage: socialfeed [COMMAND]

Commands:
  feed                   Scroll the feed (default)
  login [EMAIL]          Sign in with email and password
  login --google         Sign in with Google in the browser
  logout                 Sign out
  whoami                 Show the signed-in account
  post TEXT [FILE...]    Publish a post with optional images or videos
  profile [UID]          Show a profile and its posts
  bio TEXT               Update your profile bio
  config                 Write a config file with the defaults

Options:
  --version, -V          Show version and exit
  --help,    -h          Show this help message";

const DEMO_EMAIL: &str = "demo@socialfeed.local";
const DEMO_PASSWORD: &str = "demo";
const PASSWORD_ENV: &str = "SOCIALFEED_PASSWORD";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Feed,
    Login { google: bool, email: Option<String> },
    Logout,
    Whoami,
    Post { text: String, files: Vec<PathBuf> },
    Profile { uid: Option<String> },
    Bio { text: String },
    Config,
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some((name, rest)) = args.split_first() else {
        return Ok(Command::Feed);
    };
    let command = match name.as_str() {
        "feed" => Command::Feed,
        "login" => {
            let google = rest.iter().any(|arg| arg == "--google");
            let email = rest.iter().find(|arg| !arg.starts_with("--")).cloned();
            Command::Login { google, email }
        }
        "logout" => Command::Logout,
        "whoami" => Command::Whoami,
        "post" => {
            let (text, files) = rest
                .split_first()
                .ok_or_else(|| anyhow!("post: missing text (use \"\" to post only files)"))?;
            Command::Post {
                text: text.clone(),
                files: files.iter().map(PathBuf::from).collect(),
            }
        }
        "profile" => Command::Profile {
            uid: rest.first().cloned(),
        },
        "bio" => Command::Bio {
            text: rest.join(" "),
        },
        "config" => Command::Config,
        other => bail!("unknown command {other:?}\n\n{USAGE}"),
    };
    Ok(command)
}

/// Stores and identity for the configured backend.
pub struct Backend {
    pub kind: BackendKind,
    pub documents: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl Backend {
    pub fn connect(cfg: &Config) -> Result<Self> {
        match cfg.backend.kind {
            BackendKind::Memory => Ok(Self::memory(cfg.backend.demo_posts)),
            BackendKind::Firebase => Self::firebase(cfg),
        }
    }

    /// Seeded in-process backend with a signed-in demo account.
    pub fn memory(demo_posts: usize) -> Self {
        let store = MemoryStore::demo(demo_posts);
        let identity = LocalIdentity::new();
        identity.register(
            DEMO_EMAIL,
            DEMO_PASSWORD,
            User {
                uid: "demo".into(),
                display_name: Some("Demo User".into()),
                photo_url: None,
            },
        );
        if let Err(err) = identity.sign_in(DEMO_EMAIL, DEMO_PASSWORD) {
            tracing::warn!(error = %err, "demo sign-in failed");
        }
        Self {
            kind: BackendKind::Memory,
            documents: Arc::new(store.clone()),
            blobs: Arc::new(store),
            identity: Arc::new(identity),
        }
    }

    fn firebase(cfg: &Config) -> Result<Self> {
        let fb = FirebaseConfig {
            api_key: cfg.backend.api_key.clone(),
            project_id: cfg.backend.project_id.clone(),
            storage_bucket: cfg.backend.storage_bucket.clone(),
            endpoints: Endpoints::default(),
            request_timeout: cfg.backend.request_timeout,
        };
        let state = StateStore::open(storage::Options::default()).context("open state database")?;
        let mut identity = FirebaseIdentity::new(fb.clone(), Some(state))?;
        if !cfg.backend.oauth_client_id.trim().is_empty() {
            identity = identity.with_oauth(
                oauth::Config {
                    client_id: cfg.backend.oauth_client_id.clone(),
                    client_secret: cfg.backend.oauth_client_secret.clone(),
                    redirect_uri: cfg.backend.oauth_redirect_uri.clone(),
                    ..oauth::Config::default()
                },
                open_in_browser,
            );
        }
        if let Some(user) = identity.resume().context("restore saved session")? {
            tracing::debug!(uid = %user.uid, "restored saved session");
        }
        let identity: Arc<dyn IdentityProvider> = Arc::new(identity);
        Ok(Self {
            kind: BackendKind::Firebase,
            documents: Arc::new(FirestoreStore::new(&fb, identity.clone())?),
            blobs: Arc::new(FirebaseBlobStore::new(&fb, identity.clone())?),
            identity,
        })
    }
}

fn open_in_browser(url: &str) {
    eprintln!("Opening your browser to sign in...");
    if let Err(err) = webbrowser::open(url) {
        tracing::debug!(error = %err, "could not launch browser");
        eprintln!("Open this URL to continue:\n{url}");
    }
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;

    if command == Command::Config {
        let (path, created) = config::write_template(None)?;
        let shown = friendly_path(Some(&path));
        if created {
            println!("Wrote default config to {shown}");
        } else {
            println!("Config already exists at {shown}");
        }
        return Ok(());
    }

    let backend = Backend::connect(&cfg)?;
    let session = Session::init(backend.identity.clone());
    let result = dispatch(command, &cfg, &backend, &session);
    session.close();
    result
}

fn dispatch(command: Command, cfg: &Config, backend: &Backend, session: &Session) -> Result<()> {
    match command {
        Command::Feed => {
            require_signed_in(backend, session)?;
            run_feed(cfg, backend)
        }
        Command::Login { google, email } => login(backend, session, google, email),
        Command::Logout => {
            session.logout().context("sign out")?;
            println!("Signed out.");
            Ok(())
        }
        Command::Whoami => {
            match session.current_user() {
                Some(user) => println!("{} ({})", user.display_label(), user.uid),
                None => println!("Not signed in."),
            }
            Ok(())
        }
        Command::Post { text, files } => {
            let author = require_signed_in(backend, session)?;
            publish(backend, author.as_ref(), text, &files)
        }
        Command::Profile { uid } => {
            let viewer = require_signed_in(backend, session)?;
            let uid = uid
                .or_else(|| viewer.as_ref().map(|user| user.uid.clone()))
                .ok_or_else(|| anyhow!("profile: which user? pass a uid"))?;
            show_profile(backend, viewer.as_ref(), &uid)
        }
        Command::Bio { text } => {
            let viewer = require_signed_in(backend, session)?;
            let uid = viewer
                .as_ref()
                .map(|user| user.uid.clone())
                .ok_or_else(|| anyhow!("bio: sign in first"))?;
            Profiles::new(backend.documents.clone()).update_bio(viewer.as_ref(), &uid, &text)?;
            println!("Bio updated.");
            Ok(())
        }
        Command::Config => Ok(()),
    }
}

/// Protected commands need an account, except on the offline demo backend.
fn require_signed_in(backend: &Backend, session: &Session) -> Result<Option<User>> {
    match (session.current_user(), backend.kind) {
        (Some(user), _) => Ok(Some(user)),
        (None, BackendKind::Memory) => Ok(None),
        (None, BackendKind::Firebase) => bail!("Not signed in. Run `socialfeed login` first."),
    }
}

fn login(backend: &Backend, session: &Session, google: bool, email: Option<String>) -> Result<()> {
    let (result, provider) = if google {
        (session.login_with(OAuthProvider::Google), Some(OAuthProvider::Google))
    } else {
        let email = match email {
            Some(email) => email,
            None => prompt("Email: ")?,
        };
        let password = match std::env::var(PASSWORD_ENV) {
            Ok(password) => password,
            Err(_) => prompt("Password: ")?,
        };
        (session.login(&email, &password), None)
    };

    let user = result.map_err(|_| anyhow!(login_failure_message(provider)))?;
    if let Err(err) = Profiles::new(backend.documents.clone()).ensure(&user) {
        tracing::warn!(error = %err, "could not update profile document");
    }
    println!("Signed in as {}.", user.display_label());
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{label}");
    io::stderr().flush().ok();
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn publish(
    backend: &Backend,
    author: Option<&User>,
    text: String,
    files: &[PathBuf],
) -> Result<()> {
    let attachments = files
        .iter()
        .map(|path| Attachment::from_path(path))
        .collect::<Result<Vec<_>>>()?;
    let composer = PostComposer::new(backend.documents.clone(), backend.blobs.clone());

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Posting...");
    let result = composer.create_post_with(
        author,
        Draft { text, attachments },
        &mut |path| spinner.set_message(format!("Uploading {path}")),
    );
    spinner.finish_and_clear();

    match result {
        Ok(id) => {
            println!("Posted ({id}).");
            Ok(())
        }
        Err(ComposeError::Empty) => bail!("Nothing to post: add some text or a file."),
        Err(err) => Err(err.into()),
    }
}

fn show_profile(backend: &Backend, viewer: Option<&User>, uid: &str) -> Result<()> {
    let page = Profiles::new(backend.documents.clone()).load(uid)?;
    let name = page
        .profile
        .display_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| uid.to_string());
    println!("{name}");
    println!("{}", page.profile.bio_or_default());
    if page.can_edit(viewer) {
        println!("(edit with `socialfeed bio <text>`)");
    }
    println!();

    let width = terminal_width();
    let now = Utc::now();
    if page.posts.is_empty() {
        println!("No posts yet.");
    }
    for post in &page.posts {
        for line in render_post(post, width, now) {
            println!("{line}");
        }
    }
    Ok(())
}

fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .unwrap_or(80)
        .clamp(40, 160)
}

/// Lines for one post block, ending with a blank separator.
fn render_post(post: &Post, width: usize, now: chrono::DateTime<Utc>) -> Vec<String> {
    let mut lines = vec![format!(
        "{} · {}",
        post.user_name,
        relative_time(post.created_at, now)
    )];
    if !post.text.trim().is_empty() {
        let options = WrapOptions::new(width.saturating_sub(2).max(10))
            .initial_indent("  ")
            .subsequent_indent("  ");
        lines.extend(wrap(&post.text, options).into_iter().map(|line| line.into_owned()));
    }
    for media in &post.media {
        let label = match media.kind {
            MediaKind::Image => "[image]",
            MediaKind::Video => "[video]",
        };
        lines.push(format!("  {label} {}", media.url));
    }
    lines.push(String::new());
    lines
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn run_feed(cfg: &Config, backend: &Backend) -> Result<()> {
    let mut screen = FeedScreen::new(cfg, backend.documents.clone());
    screen.start();
    let input = spawn_stdin_reader();
    let ticker = tick(Duration::from_millis(50));

    println!("j/Enter: down  k: up  g/G: top/bottom  r: reload  rows N: resize  q: quit");
    loop {
        select! {
            recv(input) -> line => match line {
                Ok(line) => {
                    if !screen.handle_input(line.trim()) {
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(ticker) -> _ => {}
        }
        screen.pump();
    }
    screen.close();
    Ok(())
}

type LoadCallback = Box<dyn FnMut()>;

/// Line-oriented feed view: the rendered posts are laid out as rows, a
/// viewport of `viewport_rows` scrolls over them, and a sentinel row after
/// the last post pulls in the next page when it scrolls into view.
struct FeedScreen {
    pager: FeedPager,
    region: ScrollRegion,
    trigger: ViewportTrigger<LoadCallback>,
    load_requests: Receiver<()>,
    gates: HashMap<String, VideoGate<MpvPlayer>>,
    player: PlayerConfig,
    lines: Vec<String>,
    width: usize,
    rows: usize,
    dirty: bool,
}

impl FeedScreen {
    fn new(cfg: &Config, documents: Arc<dyn DocumentStore>) -> Self {
        let (load_tx, load_requests) = unbounded();
        let callback: LoadCallback = Box::new(move || {
            let _ = load_tx.send(());
        });
        let rows = cfg.feed.viewport_rows.max(1);
        Self {
            pager: FeedPager::new(
                documents,
                PagerConfig {
                    page_size: cfg.feed.page_size,
                    fetch_timeout: cfg.feed.fetch_timeout,
                },
            ),
            region: ScrollRegion::new(rows),
            trigger: ViewportTrigger::new(Threshold::ANY, callback),
            load_requests,
            gates: HashMap::new(),
            player: cfg.player.clone(),
            lines: Vec::new(),
            width: terminal_width(),
            rows,
            dirty: true,
        }
    }

    fn start(&mut self) {
        self.pager.request_initial();
        self.trigger.start(&self.region, self.sentinel());
    }

    fn sentinel(&self) -> Bounds {
        Bounds::new(self.lines.len(), 1)
    }

    fn max_offset(&self) -> usize {
        self.sentinel().bottom().saturating_sub(self.rows)
    }

    /// Returns false when the user asked to quit.
    fn handle_input(&mut self, input: &str) -> bool {
        let offset = self.region.viewport().offset;
        let half = (self.rows / 2).max(1);
        match input {
            "q" | "quit" => return false,
            "" | "j" => self.region.scroll_to((offset + half).min(self.max_offset())),
            "k" => self.region.scroll_by(-(half as isize)),
            "g" => self.region.scroll_to(0),
            "G" => self.region.scroll_to(self.max_offset()),
            "r" => self.pager.request_initial(),
            other if other.starts_with("rows ") => match other[5..].trim().parse::<usize>() {
                Ok(rows) => self.resize(rows),
                Err(_) => println!("Usage: rows N"),
            },
            other => match other.parse::<usize>() {
                Ok(row) => self.region.scroll_to(row.min(self.max_offset())),
                Err(_) => println!("Unknown key {other:?}"),
            },
        }
        self.dirty = true;
        true
    }

    fn resize(&mut self, rows: usize) {
        self.rows = rows.max(1);
        self.region.resize(self.rows);
        let offset = self.region.viewport().offset;
        if offset > self.max_offset() {
            self.region.scroll_to(self.max_offset());
        }
    }

    /// One event-loop turn: apply finished fetches, deliver visibility
    /// changes, and start any load they asked for.
    fn pump(&mut self) {
        let mut loaded = false;
        while let Some(event) = self.pager.poll() {
            match event {
                PageEvent::Loaded { mode, added } => {
                    tracing::debug!(?mode, added, "feed page applied");
                    if mode == LoadMode::Replace {
                        self.region.scroll_to(0);
                    }
                    self.relayout();
                    loaded = true;
                }
                PageEvent::Failed { error, .. } => {
                    eprintln!("Could not load posts: {error}");
                    self.dirty = true;
                }
            }
        }

        let entries = self.region.take_entries();
        if !entries.is_empty() {
            self.trigger.dispatch(&entries);
            for gate in self.gates.values_mut() {
                gate.handle(&entries);
            }
        }

        let mut wanted = false;
        while self.load_requests.try_recv().is_ok() {
            wanted = true;
        }
        // A sentinel that stays visible across a load produces no new edge.
        if loaded && self.trigger.is_intersecting() {
            wanted = true;
        }
        if wanted && self.pager.has_more() && self.pager.request_next() {
            self.dirty = true;
        }

        if self.dirty {
            self.render();
            self.dirty = false;
        }
    }

    fn relayout(&mut self) {
        let now = Utc::now();
        let mut lines = Vec::new();
        let mut video_bounds: HashMap<String, (Bounds, String)> = HashMap::new();
        for post in self.pager.posts() {
            let block = render_post(post, self.width, now);
            if let Some(video) = post.first_video() {
                video_bounds.insert(
                    post.id.clone(),
                    (Bounds::new(lines.len(), block.len()), video.url.clone()),
                );
            }
            lines.extend(block);
        }
        self.lines = lines;
        self.trigger.move_sentinel(self.sentinel());

        if self.player.autoplay {
            self.gates.retain(|id, _| video_bounds.contains_key(id));
            for (id, (bounds, url)) in video_bounds {
                match self.gates.get(&id) {
                    Some(gate) => gate.move_to(bounds),
                    None => {
                        let mut gate =
                            VideoGate::new(MpvPlayer::new(self.player.video_command.clone(), url));
                        gate.attach(&self.region, bounds);
                        self.gates.insert(id, gate);
                    }
                }
            }
        }
        self.dirty = true;
    }

    fn render(&self) {
        let viewport = self.region.viewport();
        let end = viewport.bottom().min(self.lines.len());
        let mut out = io::stdout().lock();
        let _ = writeln!(out);
        for line in self.lines.iter().take(end).skip(viewport.offset) {
            let _ = writeln!(out, "{line}");
        }
        let status = if self.pager.is_loading() {
            "loading..."
        } else if !self.pager.has_more() {
            "end of feed"
        } else {
            ""
        };
        let _ = writeln!(
            out,
            "-- rows {}-{} of {} · {} posts {status}",
            viewport.offset.min(self.lines.len()),
            end,
            self.lines.len(),
            self.pager.posts().len(),
        );
        let _ = out.flush();
    }

    fn close(&mut self) {
        self.trigger.stop();
        for (_, mut gate) in self.gates.drain() {
            gate.detach();
        }
    }
}

fn friendly_path(path: Option<&PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/socialfeed/config.yaml".to_string()
    }
}
