//! Prompt builders. Wording here is deliberately plain; the scoring layer,
//! not the prompt, is what enforces output quality.

use std::fmt::Write as _;

use super::context::ContextBlock;
use super::plan::ReplyPlan;

pub struct Prompt {
    pub system: String,
    pub user: String,
}

pub fn plan_prompt(block: &ContextBlock) -> Prompt {
    let frame = &block.frame;
    let shape = if frame.question_like {
        "对方在提问"
    } else if frame.status_update {
        "对方在同步近况"
    } else {
        "日常闲聊"
    };
    let system = format!(
        "你是聊天回复的策划器。根据对话情况输出一个 JSON 对象：\
         {{\"candidate_count\": 数字, \"bubble_count\": 数字, \"tone_tags\": [字符串]}}。\
         只输出 JSON，不要解释。人设：{}",
        block.persona_brief
    );
    let user = format!(
        "对方刚发来：{}\n情景：{}\n建议每条回复拆成 {} 到 {} 个气泡。",
        frame.user_text, shape, frame.bubbles.min, frame.bubbles.max
    );
    Prompt { system, user }
}

pub fn generation_prompt(block: &ContextBlock, plan: &ReplyPlan) -> Prompt {
    let system = format!(
        "你在微信上替一个真实的人回消息，必须完全模仿这个人的说话方式。\
         人设：{}。语气标签：{}。\
         输出 JSON：{{\"candidates\": [{{\"bubbles\": [\"...\"]}}]}}，\
         共 {} 个候选，每个候选 {} 个左右的短气泡，每个气泡不超过40字。\
         不要解释，不要用任何助手口吻。",
        block.persona_brief,
        plan.tone_tags.join("、"),
        plan.candidate_count,
        plan.bubble_target,
    );

    let mut user = String::new();
    if !block.segments.is_empty() {
        let _ = writeln!(user, "【历史相似对话】");
        for seg in block.segments.iter().take(3) {
            for line in &seg.lines {
                let _ = writeln!(user, "{}: {}", line.role, line.content);
            }
            let _ = writeln!(user, "---");
        }
    }
    if !block.style_refs.is_empty() {
        let _ = writeln!(user, "【这个人常见的说话样例】");
        for s in &block.style_refs {
            let _ = writeln!(user, "- {s}");
        }
    }
    if !block.online_memory.is_empty() {
        let _ = writeln!(user, "【更早聊过的相关内容】");
        for m in &block.online_memory {
            let _ = writeln!(user, "- {m}");
        }
    }
    if !block.recent.is_empty() {
        let _ = writeln!(user, "【最近几条消息】");
        for m in &block.recent {
            let _ = writeln!(user, "{}: {}", m.role, m.content);
        }
    }
    let _ = write!(user, "对方刚发来：{}\n请给出回复候选。", block.frame.user_text);
    Prompt { system, user }
}

pub fn critic_prompt(user_text: &str, pool: &[Vec<String>]) -> Prompt {
    let system = "你是聊天回复的评审。从编号候选里选出最自然、最贴合对方消息的一条，\
         只输出它的编号数字，不要输出别的。"
        .to_string();
    let mut user = format!("对方消息：{user_text}\n候选：\n");
    for (i, bubbles) in pool.iter().enumerate() {
        let _ = writeln!(user, "{i}: {}", bubbles.join(" / "));
    }
    Prompt { system, user }
}

pub fn repair_prompt(block: &ContextBlock, bubbles: &[String]) -> Prompt {
    let system = format!(
        "下面这条回复有点偏题或不贴合人设，请做最小改写：保持原有语气和长度，\
         改成紧扣对方消息的说法。人设：{}。\
         输出 JSON：{{\"bubbles\": [\"...\"]}}，不要解释。",
        block.persona_brief
    );
    let user = format!(
        "对方消息：{}\n待修复回复：{}",
        block.frame.user_text,
        bubbles.join(" / ")
    );
    Prompt { system, user }
}
