//! Built-in template catalog.

use std::sync::Arc;

use crate::prompt;
use crate::registry::TemplateMeta;
use crate::resolver::{InternVlStrategy, LlavaStrategy, QwenAudioStrategy, QwenVlStrategy};
use crate::template::{Segment, TemplateDefinition};
use crate::DEFAULT_SYSTEM;

const BOS: &str = "bos_token_id";
const EOS: &str = "eos_token_id";
const CHATGLM_PREFIX: [u32; 2] = [64790, 64792];

fn bos() -> Segment {
    Segment::symbols(&[BOS])
}

fn eos() -> Segment {
    Segment::symbols(&[EOS])
}

fn default_template() -> TemplateDefinition {
    TemplateDefinition::new(
        prompt!["{{SYSTEM}}\n\n"],
        prompt!["### Human:\n{{QUERY}}\n\n### Assistant:\n"],
        Some(prompt!["\n\n"]),
        prompt![eos()],
    )
    .with_default_system(DEFAULT_SYSTEM)
}

fn chatml() -> TemplateDefinition {
    TemplateDefinition::new(
        prompt!["<|im_start|>system\n{{SYSTEM}}<|im_end|>\n"],
        prompt!["<|im_start|>user\n{{QUERY}}<|im_end|>\n<|im_start|>assistant\n"],
        Some(prompt!["<|im_end|>\n"]),
        prompt![Segment::symbols(&["<|im_end|>"])],
    )
    .with_tool_prompt(prompt!["<|im_start|>tool\n{{QUERY}}<|im_end|>\n<|im_start|>assistant\n"])
    .with_stop_words(&["<|im_end|>", "<|endoftext|>"])
}

fn llama() -> TemplateDefinition {
    TemplateDefinition::new(
        prompt![bos(), "[INST] "],
        prompt!["{{QUERY}} [/INST]"],
        Some(prompt![" ", Segment::symbols(&[EOS, BOS]), "[INST] "]),
        prompt![eos()],
    )
    .with_system_prefix(prompt![bos(), "[INST] <<SYS>>\n{{SYSTEM}}\n<</SYS>>\n\n"])
}

fn chatglm2() -> TemplateDefinition {
    TemplateDefinition::new(
        prompt![Segment::ids(&CHATGLM_PREFIX)],
        prompt!["[Round {{ROUND1}}]\n\n问：{{QUERY}}\n\n答："],
        Some(prompt!["\n\n"]),
        prompt![eos()],
    )
    .with_system_prefix(prompt![Segment::ids(&CHATGLM_PREFIX), "{{SYSTEM}}"])
}

/// Every built-in `(id, definition, meta)`.
pub fn builtin_templates() -> Vec<(&'static str, TemplateDefinition, TemplateMeta)> {
    vec![
        ("default", default_template(), TemplateMeta::default()),
        (
            "default-generation",
            TemplateDefinition::new(prompt![], prompt!["{{QUERY}}"], None, prompt![eos()]),
            TemplateMeta::generation_only(),
        ),
        ("chatml", chatml(), TemplateMeta::default()),
        (
            "qwen",
            chatml().with_default_system(DEFAULT_SYSTEM),
            TemplateMeta::default(),
        ),
        (
            "baichuan",
            TemplateDefinition::new(
                prompt!["{{SYSTEM}}"],
                prompt![Segment::ids(&[195]), "{{QUERY}}", Segment::ids(&[196])],
                Some(prompt![]),
                prompt![eos()],
            ),
            TemplateMeta::default(),
        ),
        ("chatglm2", chatglm2(), TemplateMeta::default()),
        (
            "chatglm2-generation",
            TemplateDefinition::new(
                prompt![Segment::ids(&CHATGLM_PREFIX)],
                prompt!["{{QUERY}}"],
                None,
                prompt![eos()],
            ),
            TemplateMeta::generation_only(),
        ),
        ("llama", llama(), TemplateMeta::default()),
        (
            "openbuddy",
            TemplateDefinition::new(
                prompt!["{{SYSTEM}}\n\n"],
                prompt!["User: {{QUERY}}\nAssistant:"],
                Some(prompt!["\n"]),
                prompt![eos()],
            )
            .with_default_system(
                "You are a helpful, respectful and honest INTP-T AI Assistant named Buddy. \
                 You always answer as helpfully as possible, while being safe.",
            )
            .with_auto_add_bos(true),
            TemplateMeta::default(),
        ),
        (
            "internlm",
            TemplateDefinition::new(
                prompt!["<s>"],
                prompt!["<|User|>:{{QUERY}}\n<|Bot|>:"],
                Some(prompt!["<eoa>\n"]),
                prompt!["<eoa></s>"],
            ),
            TemplateMeta::default(),
        ),
        (
            "xverse",
            TemplateDefinition::new(
                prompt!["{{SYSTEM}}"],
                prompt!["Human: {{QUERY}}\n\nAssistant: "],
                Some(prompt![eos()]),
                prompt![eos()],
            ),
            TemplateMeta::default(),
        ),
        (
            "ziya",
            TemplateDefinition::new(
                prompt![bos(), "{{SYSTEM}}"],
                prompt!["<human>:{{QUERY}}\n<bot>:"],
                Some(prompt!["\n"]),
                prompt![eos()],
            ),
            TemplateMeta::default(),
        ),
        (
            "qwen-vl",
            chatml()
                .with_default_system(DEFAULT_SYSTEM)
                .with_strategy(Arc::new(QwenVlStrategy)),
            TemplateMeta::lazy(),
        ),
        (
            "qwen-audio",
            chatml()
                .with_default_system(DEFAULT_SYSTEM)
                .with_strategy(Arc::new(QwenAudioStrategy)),
            TemplateMeta::lazy(),
        ),
        (
            "llava",
            TemplateDefinition::new(
                prompt![bos()],
                prompt!["USER: {{QUERY}}\nASSISTANT:"],
                Some(prompt![eos()]),
                prompt![eos()],
            )
            .with_strategy(Arc::new(LlavaStrategy)),
            TemplateMeta {
                lazy_tokenize: true,
                dataloader_num_workers: Some(0),
                ..Default::default()
            },
        ),
        (
            "internvl",
            TemplateDefinition::new(
                prompt![bos(), "<|im_start|>system\n{{SYSTEM}}<|im_end|>\n"],
                prompt!["<|im_start|>user\n{{QUERY}}<|im_end|>\n<|im_start|>assistant\n"],
                Some(prompt!["<|im_end|>\n"]),
                prompt![Segment::symbols(&["<|im_end|>"])],
            )
            .with_default_system("You are an AI assistant whose name is InternLM (书生·浦语).")
            .with_strategy(Arc::new(InternVlStrategy::default())),
            TemplateMeta {
                lazy_tokenize: true,
                dataloader_pin_memory: Some(false),
                ..Default::default()
            },
        ),
    ]
}
