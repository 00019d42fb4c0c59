use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "question_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QuestionCategory {
    Technical,
    Behavioral,
    Situational,
    General,
}

impl QuestionCategory {
    /// Lenient parse of provider output ("Behavioural", "TECHNICAL", ...).
    pub fn parse_lenient(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        if s.starts_with("tech") {
            Some(Self::Technical)
        } else if s.starts_with("behav") {
            Some(Self::Behavioral)
        } else if s.starts_with("situ") {
            Some(Self::Situational)
        } else if s.starts_with("gen") {
            Some(Self::General)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "question_difficulty", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "easy" => Some(Self::Easy),
            "medium" | "moderate" => Some(Self::Medium),
            "hard" | "difficult" => Some(Self::Hard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Question {
    pub id: Uuid,
    pub session_id: Uuid,
    pub text: String,
    pub category: QuestionCategory,
    pub skill: String,
    pub difficulty: Difficulty,
    pub position: i32,
    pub is_follow_up: bool,
    pub parent_id: Option<Uuid>,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

/// Question data before persistence assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQuestion {
    pub text: String,
    pub category: QuestionCategory,
    pub skill: String,
    pub difficulty: Difficulty,
    pub position: i32,
    pub is_follow_up: bool,
    pub parent_id: Option<Uuid>,
    pub is_final: bool,
}

impl NewQuestion {
    pub fn follow_up(text: String, parent: &Question, position: i32) -> Self {
        Self {
            text,
            category: parent.category,
            skill: parent.skill.clone(),
            difficulty: parent.difficulty,
            position,
            is_follow_up: true,
            parent_id: Some(parent.id),
            is_final: false,
        }
    }

    pub fn closing(text: String, skill: &str, position: i32) -> Self {
        Self {
            text,
            category: QuestionCategory::General,
            skill: skill.to_string(),
            difficulty: Difficulty::Medium,
            position,
            is_follow_up: false,
            parent_id: None,
            is_final: true,
        }
    }
}

/// A question as produced by the completion provider (and stored in the question cache).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    pub id: String,
    pub text: String,
    pub category: QuestionCategory,
    pub skill: String,
    pub difficulty: Difficulty,
}

impl GeneratedQuestion {
    pub fn into_new(self, position: i32) -> NewQuestion {
        NewQuestion {
            text: self.text,
            category: self.category,
            skill: self.skill,
            difficulty: self.difficulty,
            position,
            is_follow_up: false,
            parent_id: None,
            is_final: false,
        }
    }
}
