use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::correlator::now_unix_ms;
use crate::error::RelayError;

const PERSISTENCE_SCHEMA_VERSION: u32 = 1;

/// Local denormalized copy of an agent-owned group. Never authoritative;
/// superseded by agent data whenever the agent is reachable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    #[serde(default)]
    pub course: String,
    #[serde(default)]
    pub created_at_unix_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StudentRecord {
    pub name: String,
    pub group_name: String,
    #[serde(default)]
    pub student_id: String,
    #[serde(default)]
    pub created_at_unix_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JournalEntry {
    pub date: String,
    pub student_name: String,
    pub group_name: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub grade: Option<i64>,
    #[serde(default = "default_true")]
    pub attendance: bool,
    #[serde(default)]
    pub comments: String,
    pub teacher_id: String,
    #[serde(default)]
    pub created_at_unix_ms: u64,
}

/// Backup-authoritative credential row. Exists so login keeps working with
/// zero agent connectivity; not part of the cache/outbox duality.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TeacherRecord {
    pub teacher_id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub password: String,
}

/// One queued mutation awaiting replay against the agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: u64,
    pub agent_id: String,
    pub action_type: String,
    pub payload: Value,
    pub created_at_unix_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    #[serde(default = "snapshot_schema_version")]
    schema_version: u32,
    #[serde(default)]
    outbox_sequence: u64,
    #[serde(default)]
    groups: BTreeMap<String, GroupRecord>,
    #[serde(default)]
    students: BTreeMap<String, StudentRecord>,
    #[serde(default)]
    journal: Vec<JournalEntry>,
    #[serde(default)]
    teachers: BTreeMap<String, TeacherRecord>,
    #[serde(default)]
    outbox: VecDeque<OutboxEntry>,
}

/// Durable backup store: read-through entity cache, FIFO outbox, and the
/// backup-authoritative credential collection.
///
/// State lives in memory behind one `RwLock` and is persisted as a JSON
/// snapshot after every logical mutation (temp file + rename). A mutation
/// and its outbox append commit under the same write guard and land in the
/// same snapshot, so neither can survive without the other.
pub struct BackupStore {
    inner: tokio::sync::RwLock<StoreSnapshot>,
    persist_lock: tokio::sync::Mutex<()>,
    state_path: Option<PathBuf>,
}

impl BackupStore {
    pub fn new(state_path: Option<PathBuf>) -> Self {
        let snapshot = load_snapshot_from_disk(state_path.as_deref())
            .unwrap_or_else(seeded_snapshot);
        Self {
            inner: tokio::sync::RwLock::new(snapshot),
            persist_lock: tokio::sync::Mutex::new(()),
            state_path,
        }
    }

    // ---- reads -------------------------------------------------------

    /// Groups ordered by course then name, like the agent reports them.
    pub async fn list_groups(&self) -> Vec<GroupRecord> {
        let guard = self.inner.read().await;
        let mut groups = guard.groups.values().cloned().collect::<Vec<_>>();
        groups.sort_by(|lhs, rhs| {
            lhs.course
                .cmp(&rhs.course)
                .then_with(|| lhs.name.cmp(&rhs.name))
        });
        groups
    }

    pub async fn list_students(&self, group_name: &str) -> Vec<StudentRecord> {
        let guard = self.inner.read().await;
        let mut students = guard
            .students
            .values()
            .filter(|student| student.group_name == group_name)
            .cloned()
            .collect::<Vec<_>>();
        students.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        students
    }

    pub async fn find_teacher(&self, teacher_id: &str, password: &str) -> Option<TeacherRecord> {
        let guard = self.inner.read().await;
        guard
            .teachers
            .get(teacher_id)
            .filter(|teacher| teacher.password == password)
            .cloned()
    }

    pub async fn outbox_entries(&self, agent_id: &str) -> Vec<OutboxEntry> {
        let guard = self.inner.read().await;
        let mut entries = guard
            .outbox
            .iter()
            .filter(|entry| entry.agent_id == agent_id)
            .cloned()
            .collect::<Vec<_>>();
        entries.sort_by_key(|entry| entry.id);
        entries
    }

    pub async fn pending_outbox_count(&self) -> usize {
        let guard = self.inner.read().await;
        guard.outbox.len()
    }

    // ---- cache refresh (NORMAL-mode read-through) --------------------

    /// Upserts the group collection from a successful agent read.
    pub async fn refresh_groups(&self, data: &Value) -> Result<(), RelayError> {
        let Some(items) = data.as_array() else {
            return Ok(());
        };
        let groups = items
            .iter()
            .filter_map(|item| serde_json::from_value::<GroupRecord>(item.clone()).ok())
            .filter(|group| !group.name.is_empty())
            .collect::<Vec<_>>();
        if groups.is_empty() {
            return Ok(());
        }
        {
            let mut guard = self.inner.write().await;
            for group in groups {
                guard.groups.insert(group.name.clone(), group);
            }
        }
        self.persist().await
    }

    pub async fn refresh_students(&self, data: &Value) -> Result<(), RelayError> {
        let Some(items) = data.as_array() else {
            return Ok(());
        };
        let students = items
            .iter()
            .filter_map(|item| serde_json::from_value::<StudentRecord>(item.clone()).ok())
            .filter(|student| !student.name.is_empty())
            .collect::<Vec<_>>();
        if students.is_empty() {
            return Ok(());
        }
        {
            let mut guard = self.inner.write().await;
            for student in students {
                guard
                    .students
                    .insert(student_key(&student), student);
            }
        }
        self.persist().await
    }

    // ---- mutations ---------------------------------------------------

    /// Applies a mutation to the local collections without queueing it.
    /// Used to mirror a mutation the agent already confirmed.
    pub async fn apply_mutation(&self, command: &str, payload: &Value) -> Result<(), RelayError> {
        {
            let mut guard = self.inner.write().await;
            apply_mutation_locked(&mut guard, command, payload)?;
        }
        self.persist().await
    }

    /// Applies a mutation and appends it to the outbox in one transaction.
    /// Used for mutations served while the agent is unreachable.
    pub async fn apply_mutation_queued(
        &self,
        agent_id: &str,
        command: &str,
        payload: &Value,
    ) -> Result<(), RelayError> {
        {
            let mut guard = self.inner.write().await;
            apply_mutation_locked(&mut guard, command, payload)?;
            guard.outbox_sequence += 1;
            let entry = OutboxEntry {
                id: guard.outbox_sequence,
                agent_id: agent_id.to_string(),
                action_type: command.to_string(),
                payload: payload.clone(),
                created_at_unix_ms: now_unix_ms(),
            };
            guard.outbox.push_back(entry);
        }
        self.persist().await
    }

    /// Deletes one replayed entry after the agent confirmed it.
    pub async fn remove_outbox_entry(&self, id: u64) -> Result<(), RelayError> {
        {
            let mut guard = self.inner.write().await;
            guard.outbox.retain(|entry| entry.id != id);
        }
        self.persist().await
    }

    // ---- persistence -------------------------------------------------

    async fn persist(&self) -> Result<(), RelayError> {
        let Some(path) = self.state_path.as_deref() else {
            return Ok(());
        };
        let _save_guard = self.persist_lock.lock().await;
        let bytes = {
            let guard = self.inner.read().await;
            serde_json::to_vec_pretty(&*guard)
                .map_err(|err| RelayError::Store(format!("snapshot serialize failed: {err}")))?
        };
        write_bytes_to_disk(path, &bytes).map_err(RelayError::Store)
    }
}

fn student_key(student: &StudentRecord) -> String {
    if student.student_id.is_empty() {
        format!("{}/{}", student.group_name, student.name)
    } else {
        student.student_id.clone()
    }
}

fn apply_mutation_locked(
    snapshot: &mut StoreSnapshot,
    command: &str,
    payload: &Value,
) -> Result<(), RelayError> {
    match command {
        agent_abi::CMD_ADD_GROUP => {
            let name = required_str(payload, "group_name")?;
            snapshot.groups.entry(name.to_string()).or_insert_with(|| GroupRecord {
                name: name.to_string(),
                course: payload["course"].as_str().unwrap_or("").to_string(),
                created_at_unix_ms: now_unix_ms(),
            });
            Ok(())
        }
        agent_abi::CMD_ADD_STUDENT => {
            let student = StudentRecord {
                name: required_str(payload, "student_name")?.to_string(),
                group_name: required_str(payload, "group_name")?.to_string(),
                student_id: payload["student_id"].as_str().unwrap_or("").to_string(),
                created_at_unix_ms: now_unix_ms(),
            };
            snapshot.students.insert(student_key(&student), student);
            Ok(())
        }
        agent_abi::CMD_ADD_JOURNAL_ENTRY => {
            let entry = JournalEntry {
                date: payload["date"].as_str().unwrap_or("").to_string(),
                student_name: required_str(payload, "student_name")?.to_string(),
                group_name: required_str(payload, "group_name")?.to_string(),
                subject: payload["subject"].as_str().unwrap_or("").to_string(),
                topic: payload["topic"].as_str().unwrap_or("").to_string(),
                grade: payload["grade"].as_i64(),
                attendance: payload["attendance"].as_bool().unwrap_or(true),
                comments: payload["comments"].as_str().unwrap_or("").to_string(),
                teacher_id: required_str(payload, "teacher_id")?.to_string(),
                created_at_unix_ms: now_unix_ms(),
            };
            snapshot.journal.push(entry);
            Ok(())
        }
        other => Err(RelayError::Store(format!(
            "unsupported backup mutation: {other}"
        ))),
    }
}

fn required_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, RelayError> {
    payload[field]
        .as_str()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| RelayError::Store(format!("missing required field {field}")))
}

fn load_snapshot_from_disk(state_path: Option<&Path>) -> Option<StoreSnapshot> {
    let path = state_path?;
    if !path.exists() {
        return None;
    }
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            warn!("failed to read store snapshot path={} err={err}", path.display());
            return None;
        }
    };
    let snapshot = match serde_json::from_slice::<StoreSnapshot>(&data) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!("failed to parse store snapshot path={} err={err}", path.display());
            return None;
        }
    };
    if snapshot.schema_version != PERSISTENCE_SCHEMA_VERSION {
        warn!(
            "ignoring store snapshot path={} unsupported schema_version={}",
            path.display(),
            snapshot.schema_version
        );
        return None;
    }
    info!(
        groups = snapshot.groups.len(),
        students = snapshot.students.len(),
        pending_outbox = snapshot.outbox.len(),
        "loaded backup store snapshot"
    );
    Some(snapshot)
}

fn write_bytes_to_disk(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| {
            format!("failed to create store directory {}: {err}", parent.display())
        })?;
    }

    let mut temp_name = path.as_os_str().to_os_string();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);
    fs::write(&temp_path, bytes).map_err(|err| {
        format!(
            "failed to write temporary store snapshot {}: {err}",
            temp_path.display()
        )
    })?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&temp_path, path).map_err(|err| {
        format!(
            "failed to move store snapshot {} => {}: {err}",
            temp_path.display(),
            path.display()
        )
    })
}

/// First-run dataset so the hub can serve reads and logins before the agent
/// has ever connected.
fn seeded_snapshot() -> StoreSnapshot {
    let now = now_unix_ms();
    let mut snapshot = StoreSnapshot {
        schema_version: PERSISTENCE_SCHEMA_VERSION,
        ..StoreSnapshot::default()
    };

    let groups: [(&str, &str); 12] = [
        ("1П1", "1 Курс"),
        ("1Л1", "1 Курс"),
        ("1Ю1", "1 Курс"),
        ("1Б1", "1 Курс"),
        ("2Н1", "2 Курс"),
        ("2П1", "2 Курс"),
        ("2Б1", "2 Курс"),
        ("3П1", "3 Курс"),
        ("3Н1", "3 Курс"),
        ("4П1", "4 Курс"),
        ("4Н1", "4 Курс"),
        ("4Б1", "4 Курс"),
    ];
    for (name, course) in groups {
        snapshot.groups.insert(
            name.to_string(),
            GroupRecord {
                name: name.to_string(),
                course: course.to_string(),
                created_at_unix_ms: now,
            },
        );
    }

    let students: [(&str, &str, &str); 6] = [
        ("Иванов Алексей", "1П1", "ST001"),
        ("Петрова Анна", "1П1", "ST002"),
        ("Васильев Дмитрий", "1Л1", "ST005"),
        ("Фёдоров Сергей", "2П1", "ST009"),
        ("Морозова Татьяна", "2П1", "ST010"),
        ("Семёнов Артём", "3П1", "ST013"),
    ];
    for (name, group_name, student_id) in students {
        snapshot.students.insert(
            student_id.to_string(),
            StudentRecord {
                name: name.to_string(),
                group_name: group_name.to_string(),
                student_id: student_id.to_string(),
                created_at_unix_ms: now,
            },
        );
    }

    snapshot.teachers.insert(
        "teacher_001".to_string(),
        TeacherRecord {
            teacher_id: "teacher_001".to_string(),
            name: "Дежурный преподаватель".to_string(),
            role: "teacher".to_string(),
            password: "changeme".to_string(),
        },
    );

    snapshot
}

const fn default_true() -> bool {
    true
}

const fn snapshot_schema_version() -> u32 {
    PERSISTENCE_SCHEMA_VERSION
}
