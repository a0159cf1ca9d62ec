use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use taskmaster_core::capture::{TaskDraft, TaskPatch};
use taskmaster_core::model::{Priority, TaskFilter};
use taskmaster_core::normalizer::StoreLayout;

/// Read when `--password` is omitted, keeping it out of shell history.
pub const PASSWORD_ENV: &str = "TASKMASTER_PASSWORD";
pub const CONFIRM_ENV: &str = "TASKMASTER_PASSWORD_CONFIRM";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "taskmaster",
    version,
    about = "Earn points for the tasks you finish and spend them on rewards.",
    after_help = "Examples:\n  TASKMASTER_PASSWORD=secret1 TASKMASTER_PASSWORD_CONFIRM=secret1 taskmaster signup ana@example.com\n  taskmaster add Buy milk --points 20 --due tomorrow\n  taskmaster list --filter pending --search milk\n  taskmaster done 01HX3Y\n  taskmaster watch --log debug"
)]
pub struct Cli {
    /// Override the data directory (defaults to platform-specific app dir)
    #[arg(long, value_name = "PATH", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Record layout used in the store (tree or collection)
    #[arg(long, value_enum, global = true)]
    pub layout: Option<StoreLayout>,

    /// Tracing filter (e.g. "info", "debug", "taskmaster_core=trace")
    #[arg(long = "log", value_name = "DIRECTIVE", global = true)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Create an account and sign in
    Signup(SignupArgs),
    /// Sign in with an existing account
    Login(LoginArgs),
    /// Forget the signed-in account
    Logout,
    /// Show the signed-in account
    Whoami,
    /// Add a task
    Add(AddArgs),
    /// Edit fields of a task
    Edit(EditArgs),
    /// Toggle a task between pending and completed
    Done(IdArgs),
    /// Delete one or more tasks by id
    Delete(DeleteArgs),
    /// Print the task list once
    List(ListArgs),
    /// Print the task list every time it changes, until interrupted
    Watch(ListArgs),
    /// Level, points and achievements
    Profile,
    /// Show the rewards shop and your balance
    Rewards,
    /// Spend points on a reward
    Buy(BuyArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SignupArgs {
    #[arg(value_name = "EMAIL")]
    pub email: String,
    #[arg(long, env = PASSWORD_ENV, hide_env_values = true)]
    pub password: String,
    /// Repeat the password
    #[arg(long, env = CONFIRM_ENV, hide_env_values = true)]
    pub confirm: String,
}

#[derive(Args, Debug, Clone)]
pub struct LoginArgs {
    #[arg(value_name = "EMAIL")]
    pub email: String,
    #[arg(long, env = PASSWORD_ENV, hide_env_values = true)]
    pub password: String,
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    /// Task title (at most 50 characters)
    #[arg(value_name = "TITLE", required = true)]
    pub title: Vec<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// Reward points (defaults to 100)
    #[arg(long, value_name = "POINTS", allow_hyphen_values = true)]
    pub points: Option<String>,

    /// Due date (ISO e.g. 2025-12-24, today, tomorrow, +3d, mon)
    #[arg(long = "due", value_name = "DATE")]
    pub due_date: Option<String>,

    #[arg(long)]
    pub category: Option<String>,

    #[arg(long, value_enum)]
    pub priority: Option<Priority>,

    /// Image attached to the task
    #[arg(long = "image", value_name = "URI")]
    pub image_uri: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    #[arg(value_name = "ID")]
    pub id: String,

    #[arg(long)]
    pub title: Option<String>,

    /// New description (pass "" to clear)
    #[arg(long)]
    pub description: Option<String>,

    #[arg(long, value_name = "POINTS", allow_hyphen_values = true)]
    pub points: Option<String>,

    /// New due date (pass "" to clear)
    #[arg(long = "due", value_name = "DATE")]
    pub due_date: Option<String>,

    #[arg(long)]
    pub category: Option<String>,

    #[arg(long, value_enum)]
    pub priority: Option<Priority>,

    #[arg(long = "image", value_name = "URI")]
    pub image_uri: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct IdArgs {
    #[arg(value_name = "ID")]
    pub id: String,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// One or more task ids to delete
    #[arg(value_name = "ID", required = true)]
    pub ids: Vec<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ListArgs {
    #[arg(long, value_enum, default_value_t = TaskFilter::All)]
    pub filter: TaskFilter,

    /// Case-insensitive match on title and description
    #[arg(long)]
    pub search: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct BuyArgs {
    /// Reward id as shown by `taskmaster rewards`
    #[arg(value_name = "REWARD")]
    pub reward: String,
}

impl From<AddArgs> for TaskDraft {
    fn from(args: AddArgs) -> Self {
        TaskDraft {
            title: args.title.join(" "),
            description: args.description,
            points: args.points.map(Into::into),
            due_date: args.due_date,
            category: args.category,
            priority: args.priority,
            image_uri: args.image_uri,
        }
    }
}

impl From<&EditArgs> for TaskPatch {
    fn from(args: &EditArgs) -> Self {
        TaskPatch {
            title: args.title.clone(),
            description: args.description.clone(),
            points: args.points.clone().map(Into::into),
            due_date: args.due_date.clone(),
            category: args.category.clone(),
            priority: args.priority,
            image_uri: args.image_uri.clone(),
        }
    }
}
