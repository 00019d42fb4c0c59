//! Prompt templates
//!
//! One builder per gateway operation. Each returns a `Prompt` whose text is a
//! pure function of its inputs, so identical inputs yield identical requests.

use crate::models::{AnswerAnalysis, JobProfile, QuestionCategory};

/// Job description text beyond this many characters is cut from the report prompt.
const REPORT_JOB_SNIPPET_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// One question/answer pair of a finished interview, as fed to the report prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub question: String,
    pub category: QuestionCategory,
    pub skill: String,
    pub answer: Option<String>,
    pub analysis: Option<AnswerAnalysis>,
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none listed".to_string()
    } else {
        items.join(", ")
    }
}

fn category_label(category: QuestionCategory) -> &'static str {
    match category {
        QuestionCategory::Technical => "technical",
        QuestionCategory::Behavioral => "behavioral",
        QuestionCategory::Situational => "situational",
        QuestionCategory::General => "general",
    }
}

pub fn parse_job_description(description: &str) -> Prompt {
    Prompt {
        system: "You are an expert job description analyzer that extracts structured information."
            .to_string(),
        user: format!(
            "Parse the following job description into a structured format.\n\
             Return a JSON object with these fields:\n\
             - \"title\": the job title\n\
             - \"company\": the company name, if available\n\
             - \"required_skills\": technical and soft skills explicitly required\n\
             - \"preferred_skills\": skills described as nice to have or preferred\n\
             - \"responsibilities\": key responsibilities\n\
             - \"qualifications\": education, experience and certifications\n\
             - \"company_values\": company values, if mentioned\n\
             Use an empty array or null for anything not found.\n\n\
             Job Description:\n{}",
            description.trim()
        ),
    }
}

pub fn generate_questions(job: &JobProfile, count: usize) -> Prompt {
    Prompt {
        system: "You are an expert interviewer that creates relevant and challenging interview questions."
            .to_string(),
        user: format!(
            "Generate {count} interview questions for a {title} position at {company}.\n\n\
             Job details:\n\
             - Required skills: {required}\n\
             - Preferred skills: {preferred}\n\
             - Responsibilities: {responsibilities}\n\
             - Qualifications: {qualifications}\n\n\
             Create a mix of technical questions that assess the required skills, \
             behavioral questions that evaluate soft skills and cultural fit, and \
             situational questions that test problem-solving.\n\n\
             Return a JSON object {{\"questions\": [...]}} where each question has:\n\
             - \"id\": a unique id (q1, q2, ...)\n\
             - \"text\": the question\n\
             - \"category\": technical, behavioral or situational\n\
             - \"skill\": the primary skill being assessed\n\
             - \"difficulty\": easy, medium or hard",
            count = count,
            title = job.title,
            company = job.company,
            required = join_or_none(&job.required_skills),
            preferred = join_or_none(&job.preferred_skills),
            responsibilities = join_or_none(&job.responsibilities),
            qualifications = join_or_none(&job.qualifications),
        ),
    }
}

pub fn analyze_answer(
    question: &str,
    category: QuestionCategory,
    skill: &str,
    answer: &str,
    job: &JobProfile,
) -> Prompt {
    Prompt {
        system: "You are an expert interview evaluator that provides detailed and constructive feedback."
            .to_string(),
        user: format!(
            "Analyze the following candidate answer to an interview question.\n\n\
             Job Position: {title}\n\
             Required Skills: {required}\n\n\
             Question ({category}, testing {skill}): {text}\n\n\
             Candidate Answer: {answer}\n\n\
             Return a JSON object with:\n\
             - \"strengths\": what the candidate did well\n\
             - \"weaknesses\": what could be improved\n\
             - \"missing_competencies\": skills or knowledge that were not demonstrated\n\
             - \"score\": 1 to 10, where 10 is excellent\n\
             - \"needs_follow_up\": true or false",
            title = job.title,
            required = join_or_none(&job.required_skills),
            category = category_label(category),
            skill = skill,
            text = question.trim(),
            answer = answer.trim(),
        ),
    }
}

pub fn generate_follow_up(
    question: &str,
    answer: &str,
    analysis: Option<&AnswerAnalysis>,
) -> Prompt {
    let analysis_block = match analysis {
        Some(a) => format!(
            "\nAnalysis:\n\
             - Strengths: {}\n\
             - Weaknesses: {}\n\
             - Missing Competencies: {}\n",
            join_or_none(&a.strengths),
            join_or_none(&a.weaknesses),
            join_or_none(&a.missing_competencies),
        ),
        None => String::new(),
    };

    Prompt {
        system: "You are an expert interviewer that asks targeted follow-up questions.".to_string(),
        user: format!(
            "A candidate was just asked a job interview question. Based on their answer, \
             ask a single thoughtful follow-up question that digs deeper into what they said. \
             Make it feel natural, as if it came from a real interviewer.\n\n\
             Original Question:\n{question}\n\n\
             Candidate's Answer:\n{answer}\n{analysis_block}\n\
             Return only the follow-up question text.",
            question = question.trim(),
            answer = answer.trim(),
            analysis_block = analysis_block,
        ),
    }
}

pub fn generate_final_pair() -> Prompt {
    Prompt {
        system: "You are a job interview expert.".to_string(),
        user: "Generate two final interview questions:\n\
               1. A classic interview question like \"What's your greatest weakness?\" or \
               \"Why do you want to work here?\"\n\
               2. A curveball question that reveals personality, creativity, or values.\n\n\
               Only return the two questions as plain text, numbered like this:\n\n\
               1. [classic question]\n\
               2. [curveball question]"
            .to_string(),
    }
}

pub fn generate_report(job_description: &str, job: &JobProfile, transcript: &[TranscriptEntry]) -> Prompt {
    let description = job_description.trim();
    let snippet: String = description.chars().take(REPORT_JOB_SNIPPET_CHARS).collect();
    let ellipsis = if description.chars().count() > REPORT_JOB_SNIPPET_CHARS {
        "..."
    } else {
        ""
    };

    let transcript_text = transcript
        .iter()
        .map(|entry| {
            let mut block = format!(
                "Question ({}, {}): {}\nAnswer: {}",
                category_label(entry.category),
                entry.skill,
                entry.question,
                entry.answer.as_deref().unwrap_or("No answer provided"),
            );
            if let Some(a) = &entry.analysis {
                block.push_str(&format!("\nEvaluator score: {:.1}/10", a.score));
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    Prompt {
        system: "You are an expert interview coach analyzing a mock interview.".to_string(),
        user: format!(
            "Generate detailed feedback based on the candidate's responses.\n\n\
             Position: {title} at {company}\n\n\
             Job Description:\n{snippet}{ellipsis}\n\n\
             Interview Transcript:\n{transcript_text}\n\n\
             Provide an analysis that helps the candidate improve. Be constructive but honest.\n\n\
             Include:\n\
             1. Overall score (0-100) with brief justification\n\
             2. 3-4 key strengths\n\
             3. 3-4 areas for improvement\n\
             4. \"Danger zone\" alerts: potential red flags in the interview, if any\n\
             5. Individual feedback for each question (score 0-100, strengths, improvements)\n\
             6. Specific next steps\n\n\
             Format the response as JSON:\n\
             {{\n\
             \"overallScore\": 85,\n\
             \"overallFeedback\": \"Brief overall assessment\",\n\
             \"keyStrengths\": [\"Strength 1\", \"Strength 2\"],\n\
             \"areasForImprovement\": [\"Area 1\", \"Area 2\"],\n\
             \"dangerZones\": [\"Flag 1\"],\n\
             \"dangerZoneRisk\": \"Low/Medium/High\",\n\
             \"questionFeedback\": [{{\"question\": \"...\", \"score\": 80, \"strengths\": [], \"improvements\": []}}],\n\
             \"nextSteps\": [\"Step 1\"]\n\
             }}",
            title = job.title,
            company = job.company,
            snippet = snippet,
            ellipsis = ellipsis,
            transcript_text = transcript_text,
        ),
    }
}
