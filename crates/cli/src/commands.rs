use std::fmt;
use std::future::Future;
use std::io::Write;

use anyhow::{anyhow, Result};
use futures::StreamExt;

use taskmaster_core::capture::TaskPatch;
use taskmaster_core::error::TaskError;
use taskmaster_core::model::{SyncStatus, Task, TaskListSnapshot};
use taskmaster_core::profile::Profile;
use taskmaster_core::rewards::find_reward;
use taskmaster_core::workspace::Workspace;

use crate::cli::{AddArgs, CliCommand, DeleteArgs, EditArgs, ListArgs, LoginArgs, SignupArgs};
use crate::config::AppConfig;

pub async fn execute<W: Write>(config: &AppConfig, command: CliCommand, mut writer: W) -> Result<()> {
    let workspace = Workspace::open(config.clone())?;
    tracing::debug!(
        data_dir = %config.data_dir().display(),
        layout = %config.layout(),
        "workspace opened"
    );
    match command {
        CliCommand::Signup(args) => handle_signup(&workspace, &args, &mut writer),
        CliCommand::Login(args) => handle_login(&workspace, &args, &mut writer),
        CliCommand::Logout => {
            if workspace.session().sign_out()? {
                writeln!(writer, "Signed out")?;
            } else {
                writeln!(writer, "Not signed in")?;
            }
            Ok(())
        }
        CliCommand::Whoami => {
            match workspace.session().account() {
                Some(account) => writeln!(writer, "{} ({})", account.email, account.user_id)?,
                None => writeln!(writer, "Not signed in")?,
            }
            Ok(())
        }
        CliCommand::Add(args) => handle_add(&workspace, args, &mut writer).await,
        CliCommand::Edit(args) => handle_edit(&workspace, &args, &mut writer).await,
        CliCommand::Done(args) => {
            let task = workspace.gateway().toggle_complete(&args.id).await?;
            let verb = if task.completed { "Completed" } else { "Reopened" };
            writeln!(writer, "{} {}", verb, task.title)?;
            Ok(())
        }
        CliCommand::Delete(args) => handle_delete(&workspace, &args, &mut writer).await,
        CliCommand::List(args) => handle_list(&workspace, &args, &mut writer).await,
        CliCommand::Watch(args) => {
            let stop = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            watch(&workspace, &args, &mut writer, stop).await
        }
        CliCommand::Profile => handle_profile(&workspace, &mut writer).await,
        CliCommand::Rewards => handle_rewards(&workspace, &mut writer).await,
        CliCommand::Buy(args) => {
            let purchase = workspace.rewards().purchase(&args.reward).await?;
            let name = find_reward(&purchase.reward_id)
                .map(|reward| reward.name)
                .unwrap_or("reward");
            let balance = workspace.rewards().wallet().await?.balance();
            writeln!(
                writer,
                "Purchased {} for {} points. Balance: {}",
                name, purchase.price, balance
            )?;
            Ok(())
        }
    }
}

fn handle_signup<W: Write>(workspace: &Workspace, args: &SignupArgs, mut writer: W) -> Result<()> {
    let account = workspace
        .accounts()?
        .sign_up(&args.email, &args.password, &args.confirm)?;
    workspace.session().sign_in(&account)?;
    writeln!(writer, "Account created. Signed in as {}", account.email)?;
    Ok(())
}

fn handle_login<W: Write>(workspace: &Workspace, args: &LoginArgs, mut writer: W) -> Result<()> {
    let account = workspace
        .accounts()?
        .sign_in(&args.email, &args.password)?;
    workspace.session().sign_in(&account)?;
    writeln!(writer, "Signed in as {}", account.email)?;
    Ok(())
}

async fn handle_add<W: Write>(workspace: &Workspace, args: AddArgs, mut writer: W) -> Result<()> {
    let task = workspace.gateway().create(&args.into()).await?;
    writeln!(writer, "Added {}", TaskLine(&task))?;
    Ok(())
}

async fn handle_edit<W: Write>(workspace: &Workspace, args: &EditArgs, mut writer: W) -> Result<()> {
    let patch = TaskPatch::from(args);
    if patch.is_empty() {
        return Err(anyhow!("Nothing to change: pass at least one field flag"));
    }
    let gateway = workspace.gateway();
    gateway.update(&args.id, &patch).await?;
    let task = gateway.fetch(&args.id).await?;
    writeln!(writer, "Updated {}", TaskLine(&task))?;
    Ok(())
}

async fn handle_delete<W: Write>(workspace: &Workspace, args: &DeleteArgs, mut writer: W) -> Result<()> {
    let gateway = workspace.gateway();
    let mut summary = DeleteSummary::default();
    for id in &args.ids {
        match gateway.delete(id).await {
            Ok(()) => summary.deleted += 1,
            Err(TaskError::NotFound { id }) => summary.missing.push(id),
            Err(TaskError::Forbidden { id }) => summary.forbidden.push(id),
            Err(err) => return Err(err.into()),
        }
    }
    summary.write_to(&mut writer)
}

fn signed_in_user(workspace: &Workspace) -> Result<String, TaskError> {
    workspace
        .current_user_id()
        .ok_or(TaskError::Unauthenticated)
}

async fn first_snapshot(workspace: &Workspace, args: &ListArgs) -> Result<TaskListSnapshot> {
    let user_id = signed_in_user(workspace)?;
    let view_model = workspace.view_model();
    let mut subscription = view_model.subscribe(&user_id).await?;
    view_model.set_filter(args.filter);
    view_model.set_search(args.search.as_deref().unwrap_or(""));
    let snapshot = subscription
        .next()
        .await
        .ok_or_else(|| anyhow!("Task subscription closed before the first snapshot"))?;
    subscription.cancel();
    Ok(snapshot)
}

async fn handle_list<W: Write>(workspace: &Workspace, args: &ListArgs, mut writer: W) -> Result<()> {
    let snapshot = first_snapshot(workspace, args).await?;
    write_snapshot(&snapshot, &mut writer)
}

/// Print every snapshot until `stop` resolves or the subscription ends.
pub async fn watch<W, S>(workspace: &Workspace, args: &ListArgs, mut writer: W, stop: S) -> Result<()>
where
    W: Write,
    S: Future<Output = ()>,
{
    let user_id = signed_in_user(workspace)?;
    let view_model = workspace.view_model();
    let mut subscription = view_model.subscribe(&user_id).await?;
    view_model.set_filter(args.filter);
    view_model.set_search(args.search.as_deref().unwrap_or(""));
    tokio::pin!(stop);

    loop {
        tokio::select! {
            biased;
            snapshot = subscription.next() => match snapshot {
                Some(snapshot) => {
                    write_snapshot(&snapshot, &mut writer)?;
                    writeln!(writer)?;
                    writer.flush()?;
                }
                None => break,
            },
            _ = &mut stop => break,
        }
    }
    subscription.cancel();
    Ok(())
}

async fn handle_profile<W: Write>(workspace: &Workspace, mut writer: W) -> Result<()> {
    let snapshot = first_snapshot(workspace, &ListArgs::default()).await?;
    let profile = Profile::from_snapshot(&snapshot);
    writeln!(writer, "Level {}", profile.level)?;
    writeln!(
        writer,
        "Progress to next level: {:.0}%",
        profile.level_progress * 100.0
    )?;
    writeln!(writer, "Completed tasks: {}", profile.completed_tasks)?;
    writeln!(writer, "Points earned: {}", profile.earned_points)?;
    writeln!(writer, "Achievements:")?;
    for achievement in &profile.unlocked {
        writeln!(writer, "  [x] {} - {}", achievement.title, achievement.description)?;
    }
    for achievement in &profile.locked {
        writeln!(writer, "  [ ] {} - {}", achievement.title, achievement.description)?;
    }
    Ok(())
}

async fn handle_rewards<W: Write>(workspace: &Workspace, mut writer: W) -> Result<()> {
    let (wallet, offers) = workspace.rewards().offers().await?;
    writeln!(writer, "Balance: {} points", wallet.balance())?;
    for offer in offers {
        let state = if offer.purchased {
            "owned"
        } else if offer.affordable {
            "available"
        } else {
            "locked"
        };
        writeln!(
            writer,
            "  {:<18} {:<18} {:>4} pts  {:<9} {}",
            offer.reward.id,
            offer.reward.name,
            offer.reward.price,
            offer.reward.kind.as_str(),
            state
        )?;
    }
    Ok(())
}

fn write_snapshot<W: Write>(snapshot: &TaskListSnapshot, mut writer: W) -> Result<()> {
    if let SyncStatus::Unavailable(message) = &snapshot.status {
        writeln!(writer, "! Store unavailable: {message} (showing last known tasks)")?;
    }
    if snapshot.tasks.is_empty() {
        writeln!(writer, "No tasks")?;
    }
    for task in &snapshot.tasks {
        let marker = if snapshot.is_unconfirmed(&task.id) { "*" } else { "" };
        writeln!(writer, "{}{}", TaskLine(task), marker)?;
    }
    writeln!(
        writer,
        "{} completed, {} pending, {} points",
        snapshot.completed_count, snapshot.pending_count, snapshot.total_points
    )?;
    if snapshot.truncated {
        writeln!(writer, "Only the first {} tasks are shown", snapshot.tasks.len())?;
    }
    if snapshot.skipped > 0 {
        writeln!(writer, "Skipped {} unreadable record(s)", snapshot.skipped)?;
    }
    Ok(())
}

struct TaskLine<'a>(&'a Task);

impl fmt::Display for TaskLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task = self.0;
        let check = if task.completed { "x" } else { " " };
        write!(f, "[{}] {}  {} ({} pts)", check, task.id, task.title, task.points)?;
        if let Some(due) = &task.due_date {
            write!(f, " due {}", due)?;
        }
        if let Some(priority) = task.priority {
            write!(f, " !{}", priority)?;
        }
        if let Some(category) = &task.category {
            write!(f, " #{}", category)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct DeleteSummary {
    deleted: usize,
    missing: Vec<String>,
    forbidden: Vec<String>,
}

impl DeleteSummary {
    fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writeln!(writer, "{}", SummaryLine::deleted(self.deleted))?;
        if !self.missing.is_empty() {
            writeln!(writer, "Not found: {}", self.missing.join(", "))?;
        }
        if !self.forbidden.is_empty() {
            writeln!(writer, "Not yours: {}", self.forbidden.join(", "))?;
        }
        Ok(())
    }
}

enum SummaryLine {
    Deleted(usize),
    NoneDeleted,
}

impl SummaryLine {
    fn deleted(count: usize) -> Self {
        if count > 0 {
            SummaryLine::Deleted(count)
        } else {
            SummaryLine::NoneDeleted
        }
    }
}

impl fmt::Display for SummaryLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryLine::Deleted(count) => {
                write!(
                    f,
                    "Deleted {} task{}",
                    count,
                    if *count == 1 { "" } else { "s" }
                )
            }
            SummaryLine::NoneDeleted => write!(f, "No tasks deleted"),
        }
    }
}
