use serde::Serialize;

use crate::model::{Task, TaskListSnapshot};

pub const TASKS_PER_LEVEL: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Achievement {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub threshold: usize,
}

pub const ACHIEVEMENTS: [Achievement; 3] = [
    Achievement {
        id: "beginner",
        title: "Beginner",
        description: "Completed 1 task",
        threshold: 1,
    },
    Achievement {
        id: "productive",
        title: "Productive",
        description: "Completed 5 tasks",
        threshold: 5,
    },
    Achievement {
        id: "master",
        title: "Master",
        description: "Completed 10 tasks",
        threshold: 10,
    },
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub completed_tasks: usize,
    pub earned_points: u64,
    pub level: usize,
    /// Fraction of the way to the next level, in `[0, 1)`.
    pub level_progress: f64,
    pub unlocked: Vec<Achievement>,
    pub locked: Vec<Achievement>,
}

impl Profile {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let (completed_tasks, earned_points) = tasks
            .into_iter()
            .filter(|task| task.completed)
            .fold((0usize, 0u64), |(count, points), task| {
                (count + 1, points + u64::from(task.points))
            });
        Self::from_counts(completed_tasks, earned_points)
    }

    /// Uses the aggregates of a snapshot, which ignore its filter.
    pub fn from_snapshot(snapshot: &TaskListSnapshot) -> Self {
        Self::from_counts(snapshot.completed_count, snapshot.total_points)
    }

    fn from_counts(completed_tasks: usize, earned_points: u64) -> Self {
        let (unlocked, locked): (Vec<Achievement>, Vec<Achievement>) = ACHIEVEMENTS
            .iter()
            .partition(|achievement| completed_tasks >= achievement.threshold);
        Self {
            completed_tasks,
            earned_points,
            level: completed_tasks / TASKS_PER_LEVEL + 1,
            level_progress: (completed_tasks % TASKS_PER_LEVEL) as f64 / TASKS_PER_LEVEL as f64,
            unlocked,
            locked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;

    fn tasks(done: usize, open: usize) -> Vec<Task> {
        let now = Utc::now();
        (0..done)
            .map(|i| Task::new(format!("d{i}"), "done", now).with_points(10).completed_at(now))
            .chain((0..open).map(|i| Task::new(format!("o{i}"), "open", now)))
            .collect()
    }

    #[rstest]
    #[case(0, 1, 0.0, 0)]
    #[case(1, 1, 0.2, 1)]
    #[case(5, 2, 0.0, 2)]
    #[case(12, 3, 0.4, 3)]
    fn levels_and_achievements(
        #[case] done: usize,
        #[case] level: usize,
        #[case] progress: f64,
        #[case] unlocked: usize,
    ) {
        let profile = Profile::from_tasks(&tasks(done, 2));
        assert_eq!(profile.completed_tasks, done);
        assert_eq!(profile.earned_points, done as u64 * 10);
        assert_eq!(profile.level, level);
        assert!((profile.level_progress - progress).abs() < f64::EPSILON);
        assert_eq!(profile.unlocked.len(), unlocked);
        assert_eq!(profile.unlocked.len() + profile.locked.len(), ACHIEVEMENTS.len());
    }
}
