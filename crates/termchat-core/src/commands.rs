use chrono::{Local, NaiveDateTime};
use termchat_common::{ProfileConfig, ProjectEntry, SocialLink};

use crate::error::NotFoundError;

pub const KEYWORDS: &[&str] = &[
    "help", "clear", "about", "date", "getkey", "clearkey", "social", "welcome",
];

pub const CLEARKEY_RESPONSE: &str = "Stored API Key cleared from local storage.";

const HELP_BODY: &str = "Available commands:

  about        About this terminal
  clear        Clear the terminal
  date         Show current date and time
  clearkey     Clear the stored OpenAI API Key from local storage
  getkey       Show the stored OpenAI API Key (if set)
  help         Show this help message
  social       Display social media links
  welcome      Display welcome message";

const HELP_PROJECTS: &str = "
  projects     List featured projects
  project <n>  Show details for project number n";

const HELP_FOOTER: &str = "

Type any message to chat with the AI assistant.";

const WELCOME: &str = "Welcome to my terminal interface!

Type 'help' to see available commands.
Type 'about' to learn more about this project.
Type 'social' to connect with me on social media.

You can type any message to chat with the AI assistant!";

/// What a submitted line means to the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Literal(String),
    ClearTranscript,
    ShowSecret,
    ClearSecret,
    Unrecognized(String),
}

/// Source of the local time rendered by `date`.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format("%-m/%-d/%Y, %-I:%M:%S %p").to_string()
}

pub struct CommandInterpreter {
    about: String,
    social: Vec<SocialLink>,
    projects: Vec<ProjectEntry>,
    clock: Box<dyn Clock>,
}

impl CommandInterpreter {
    pub fn new(profile: &ProfileConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            about: profile.about.clone(),
            social: profile.social.clone(),
            projects: profile.projects.clone(),
            clock,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&ProfileConfig::default(), Box::new(SystemClock))
    }

    /// Exact keyword match on the trimmed, lower-cased line. Callers drop blank
    /// lines before getting here; anything else that misses is chat input.
    pub fn interpret(&self, raw_line: &str) -> CommandOutcome {
        let command = raw_line.trim().to_lowercase();
        match command.as_str() {
            "help" => CommandOutcome::Literal(self.help()),
            "clear" => CommandOutcome::ClearTranscript,
            "about" => CommandOutcome::Literal(self.about.clone()),
            "date" => CommandOutcome::Literal(format_timestamp(self.clock.now())),
            "getkey" => CommandOutcome::ShowSecret,
            "clearkey" => CommandOutcome::ClearSecret,
            "social" => CommandOutcome::Literal(self.social()),
            "welcome" => CommandOutcome::Literal(WELCOME.to_string()),
            _ => self
                .interpret_project(&command)
                .unwrap_or_else(|| CommandOutcome::Unrecognized(raw_line.to_string())),
        }
    }

    pub fn help(&self) -> String {
        let mut text = HELP_BODY.to_string();
        if !self.projects.is_empty() {
            text.push_str(HELP_PROJECTS);
        }
        text.push_str(HELP_FOOTER);
        text
    }

    fn social(&self) -> String {
        if self.social.is_empty() {
            return "No social links configured.".to_string();
        }
        let width = self
            .social
            .iter()
            .map(|link| link.label.chars().count() + 1)
            .max()
            .unwrap_or_default();
        let mut lines = vec!["Connect with me:".to_string(), String::new()];
        for link in &self.social {
            let label = format!("{}:", link.label);
            lines.push(format!("  {label:<width$}  {}", link.url));
        }
        lines.join("\n")
    }

    // Only active when a project catalog is configured.
    fn interpret_project(&self, command: &str) -> Option<CommandOutcome> {
        if self.projects.is_empty() {
            return None;
        }
        let mut words = command.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("projects"), None, None) => Some(CommandOutcome::Literal(self.project_list())),
            (Some("project"), Some(index), None) => Some(CommandOutcome::Literal(
                self.project_detail(index)
                    .unwrap_or_else(|err| err.to_string()),
            )),
            _ => None,
        }
    }

    fn project_list(&self) -> String {
        let mut lines = vec!["Featured Projects:".to_string(), String::new()];
        for (idx, project) in self.projects.iter().enumerate() {
            lines.push(format!("  {}. {} - {}", idx + 1, project.name, project.description));
        }
        lines.push(String::new());
        lines.push("Type 'project <n>' for details.".to_string());
        lines.join("\n")
    }

    fn project_detail(&self, index: &str) -> Result<String, NotFoundError> {
        let project = index
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| self.projects.get(n))
            .ok_or_else(|| NotFoundError::Project(index.to_string()))?;
        let mut text = format!("{}\n\n{}", project.name, project.description);
        if let Some(url) = &project.url {
            text.push_str(&format!("\n\n{url}"));
        }
        Ok(text)
    }
}
