//! Chat-template formatting.

use std::ffi::{CStr, CString, c_char};

use tracing::debug;

use crate::error::{LlamaError, Result};
use crate::model::LlamaModel;

/// Template used when a model ships none.
pub const DEFAULT_TEMPLATE: &str = "chatml";

/// A single chat message (role + content).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Apply a chat template to a list of messages.
///
/// * `template`: a template name (see [`builtin_templates`]) or the raw
///   template text; `None` selects ChatML.
/// * `add_assistant`: append an open assistant turn (for generation).
pub fn apply_template(template: Option<&str>, messages: &[ChatMessage], add_assistant: bool) -> Result<String> {
    let c_tmpl = CString::new(template.unwrap_or(DEFAULT_TEMPLATE))?;

    // The CStrings must outlive both native calls.
    let c_roles = messages
        .iter()
        .map(|m| CString::new(m.role.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let c_contents = messages
        .iter()
        .map(|m| CString::new(m.content.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let c_msgs: Vec<llama_sys::llama_chat_message> = c_roles
        .iter()
        .zip(c_contents.iter())
        .map(|(r, c)| llama_sys::llama_chat_message {
            role: r.as_ptr(),
            content: c.as_ptr(),
        })
        .collect();

    let render = |buf: &mut Vec<u8>| unsafe {
        llama_sys::llama_chat_apply_template(
            c_tmpl.as_ptr(),
            c_msgs.as_ptr(),
            c_msgs.len(),
            add_assistant,
            buf.as_mut_ptr() as *mut c_char,
            buf.len() as i32,
        )
    };

    let guess = messages.iter().map(|m| m.role.len() + m.content.len()).sum::<usize>() * 2 + 64;
    let mut buf = vec![0u8; guess];
    let mut needed = render(&mut buf);
    if needed < 0 {
        return Err(LlamaError::ChatTemplate(format!(
            "unsupported chat template '{}'",
            template.unwrap_or(DEFAULT_TEMPLATE)
        )));
    }
    if needed as usize > buf.len() {
        debug!(needed, guess, "growing chat template buffer");
        buf.resize(needed as usize, 0);
        needed = render(&mut buf);
        if needed < 0 || needed as usize > buf.len() {
            return Err(LlamaError::ChatTemplate("template output size changed between calls".into()));
        }
    }

    buf.truncate(needed as usize);
    String::from_utf8(buf).map_err(|e| LlamaError::ChatTemplate(format!("template output is not UTF-8: {e}")))
}

/// Apply the model's own chat template, or ChatML when it has none.
pub fn apply_model_template(model: &LlamaModel, messages: &[ChatMessage], add_assistant: bool) -> Result<String> {
    let tmpl = model.chat_template(None);
    if tmpl.is_none() {
        debug!("model has no chat template, using {DEFAULT_TEMPLATE}");
    }
    apply_template(tmpl.as_deref().or(Some(DEFAULT_TEMPLATE)), messages, add_assistant)
}

/// Names of the templates the native library recognises.
pub fn builtin_templates() -> Vec<String> {
    let n = unsafe { llama_sys::llama_chat_builtin_templates(std::ptr::null_mut(), 0) };
    if n <= 0 {
        return Vec::new();
    }
    let mut ptrs: Vec<*const c_char> = vec![std::ptr::null(); n as usize];
    let n = unsafe { llama_sys::llama_chat_builtin_templates(ptrs.as_mut_ptr(), ptrs.len()) };
    ptrs.truncate(n.max(0) as usize);
    ptrs.into_iter()
        .filter(|p| !p.is_null())
        .map(|p| unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chatml_rendering() {
        let msgs = [ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let out = apply_template(Some("chatml"), &msgs, true).unwrap();
        assert_eq!(
            out,
            "<|im_start|>system\nbe brief<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_default_is_chatml() {
        let msgs = [ChatMessage::user("hi")];
        assert_eq!(
            apply_template(None, &msgs, false).unwrap(),
            apply_template(Some("chatml"), &msgs, false).unwrap()
        );
    }

    #[test]
    fn test_markup_heavy_output_grows_buffer() {
        let msgs: Vec<_> = (0..200).map(|_| ChatMessage::user("a")).collect();
        let out = apply_template(Some("chatml"), &msgs, false).unwrap();
        assert_eq!(out.matches("<|im_start|>user\na<|im_end|>\n").count(), 200);
    }

    #[test]
    fn test_unknown_template_errors() {
        let err = apply_template(Some("definitely-not-a-template"), &[ChatMessage::user("hi")], true).unwrap_err();
        assert!(matches!(err, LlamaError::ChatTemplate(_)));
    }

    #[test]
    fn test_interior_nul_is_rejected() {
        let err = apply_template(Some("chatml"), &[ChatMessage::user("a\0b")], true).unwrap_err();
        assert!(matches!(err, LlamaError::InvalidArgument(_)));
    }

    #[test]
    fn test_builtin_templates_include_chatml() {
        let names = builtin_templates();
        assert!(names.iter().any(|n| n == "chatml"));
    }
}
