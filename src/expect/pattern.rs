//! Prompt patterns and the unconsumed-output buffer they are matched
//! against.

use regex::bytes::{Regex, RegexBuilder};
use std::ops::Range;

use crate::codec::{scan_echo, EchoScan};
use crate::error::{Error, Result};
use crate::spec::{PatternKind, Prompt, PromptTag};

/// Translate an expect-style glob into an unanchored regex.
///
/// `*` is any run of bytes, `?` any single byte, `[...]` a character class
/// and `\x` the literal `x`. A leading `^` or trailing `$` anchors the
/// pattern to the start or end of the buffer.
pub fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::from("(?s)");
    let mut start = 0;
    let mut end = chars.len();

    if chars.first() == Some(&'^') {
        out.push('^');
        start = 1;
    }
    let anchored_end = end > start
        && chars[end - 1] == '$'
        && !(end >= 2 && chars[end - 2] == '\\' && end - 2 >= start);
    if anchored_end {
        end -= 1;
    }

    let mut i = start;
    while i < end {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' if i + 1 < end => {
                i += 1;
                out.push_str(&regex::escape(&chars[i].to_string()));
            }
            '[' => match chars[i + 1..end].iter().position(|&c| c == ']') {
                Some(len) if len > 0 => {
                    out.push('[');
                    for &c in &chars[i + 1..i + 1 + len] {
                        if matches!(c, '[' | '\\' | '&' | '~') {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push(']');
                    i += len + 1;
                }
                _ => out.push_str(r"\["),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    if anchored_end {
        out.push('$');
    }
    out
}

/// A prompt compiled for matching.
#[derive(Debug, Clone)]
pub struct CompiledPrompt {
    pub tag: PromptTag,
    regex: Regex,
}

impl CompiledPrompt {
    pub fn compile(prompt: &Prompt) -> Result<Self> {
        let source = match prompt.kind {
            PatternKind::Glob => glob_to_regex(&prompt.pattern),
            PatternKind::Regex => prompt.pattern.clone(),
        };
        let regex = RegexBuilder::new(&source).build().map_err(|e| {
            Error::invalid(format!("bad {:?} prompt '{}': {}", prompt.tag, prompt.pattern, e))
        })?;
        Ok(Self {
            tag: prompt.tag,
            regex,
        })
    }
}

/// The prompt table of one session, in matching order.
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    prompts: Vec<CompiledPrompt>,
}

impl PromptMatcher {
    pub fn new(prompts: &[Prompt]) -> Result<Self> {
        let prompts = prompts
            .iter()
            .map(CompiledPrompt::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { prompts })
    }

    /// First prompt (in table order) that matches anywhere in `haystack`,
    /// with the span of its leftmost match.
    pub fn find(&self, haystack: &[u8]) -> Option<(usize, Range<usize>)> {
        self.prompts
            .iter()
            .enumerate()
            .find_map(|(i, p)| p.regex.find(haystack).map(|m| (i, m.range())))
    }

    pub fn tag(&self, index: usize) -> Option<PromptTag> {
        self.prompts.get(index).map(|p| p.tag)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.prompts.len()
    }
}

/// Program output not yet consumed by a prompt match.
///
/// After [`expect_echo`](Self::expect_echo) the echo of a command is never
/// searched for prompts: matching waits until the echo is complete and
/// starts right after it. The echo still ends up in `before_match`.
#[derive(Debug)]
pub struct ExpectBuffer {
    pending: Vec<u8>,
    before: Vec<u8>,
    match_max: usize,
    echo: Option<Vec<u8>>,
    // start of the prompt search within `pending`
    skip: usize,
}

impl ExpectBuffer {
    pub fn new(match_max: usize) -> Self {
        Self {
            pending: Vec::new(),
            before: Vec::new(),
            match_max,
            echo: None,
            skip: 0,
        }
    }

    /// The next output should start with the terminal echo of `command`.
    pub fn expect_echo(&mut self, command: &[u8]) {
        self.echo = Some(command.to_vec());
        self.skip = 0;
    }

    /// Stop waiting for an echo that has not arrived completely.
    pub fn abandon_echo(&mut self) {
        self.echo = None;
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Try the prompt table against pending output. On a match the output up
    /// to the end of the match is consumed and the part preceding the match
    /// becomes `before_match`.
    pub fn try_match(&mut self, matcher: &PromptMatcher) -> Option<usize> {
        if let Some(echo) = &self.echo {
            match scan_echo(echo, &self.pending) {
                EchoScan::Complete(end) => {
                    self.skip = end;
                    self.echo = None;
                }
                EchoScan::Partial => return None,
                EchoScan::Mismatch => self.echo = None,
            }
        }

        let (index, span) = matcher.find(&self.pending[self.skip..])?;
        let (start, end) = (self.skip + span.start, self.skip + span.end);
        self.before.clear();
        self.before.extend_from_slice(&self.pending[..start]);
        self.pending.drain(..end);
        self.skip = 0;
        Some(index)
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.match_max
    }

    pub fn before_match(&self) -> &[u8] {
        &self.before
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn discard(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        self.skip = 0;
        self.echo = None;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(tag: PromptTag, pattern: &str, kind: PatternKind) -> Prompt {
        Prompt {
            tag,
            pattern: pattern.to_string(),
            kind,
        }
    }

    fn glob(pattern: &str) -> Regex {
        Regex::new(&glob_to_regex(pattern)).unwrap()
    }

    #[test]
    fn test_glob_translation() {
        assert!(glob("$ ").is_match(b"user@host:~$ "));
        assert!(glob("ogin: ").is_match(b"\r\nLogin: "));
        assert!(glob("a*c").is_match(b"xxabbbcx"));
        assert!(glob("a?c").is_match(b"abc"));
        assert!(!glob("a?c").is_match(b"ac"));
        assert!(glob("[>#] ").is_match(b"router# "));
        assert!(glob(r"\*").is_match(b"*"));
        assert!(!glob(r"\*").is_match(b"x"));
        assert!(glob("^foo").is_match(b"foobar"));
        assert!(!glob("^foo").is_match(b"xfoo"));
        assert!(glob("> $").is_match(b"a > "));
        assert!(!glob("> $").is_match(b"a > b"));
        assert!(glob(r"cost\$").is_match(b"cost$ more"));
        assert!(glob("a[").is_match(b"a["));
    }

    #[test]
    fn test_star_is_greedy() {
        let re = glob("<*>");
        let m = re.find(b"x<a><b>y").unwrap();
        assert_eq!(m.as_bytes(), b"<a><b>");
    }

    #[test]
    fn test_table_order_wins() {
        let matcher = PromptMatcher::new(&[
            prompt(PromptTag::Command, "$ ", PatternKind::Glob),
            prompt(PromptTag::Login, "ogin:", PatternKind::Glob),
        ])
        .unwrap();
        // login appears first in the text but command is earlier in the table
        let (i, span) = matcher.find(b"login: ... $ ").unwrap();
        assert_eq!(matcher.tag(i), Some(PromptTag::Command));
        assert_eq!(span, 11..13);

        assert_eq!(
            matcher.find(b"Login: ").map(|(i, _)| matcher.tag(i)),
            Some(Some(PromptTag::Login))
        );
        assert!(matcher.find(b"nothing").is_none());
    }

    #[test]
    fn test_bad_regex_is_invalid_argument() {
        let err = PromptMatcher::new(&[prompt(PromptTag::Command, "(", PatternKind::Regex)])
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_buffer_consumes_through_match() {
        let matcher =
            PromptMatcher::new(&[prompt(PromptTag::Command, "$ ", PatternKind::Glob)]).unwrap();
        let mut buf = ExpectBuffer::new(64);
        buf.push(b"echo hi\nhi\n$ rest");
        assert_eq!(buf.try_match(&matcher), Some(0));
        assert_eq!(buf.before_match(), b"echo hi\nhi\n");
        assert_eq!(buf.pending(), b"rest");
        assert_eq!(buf.try_match(&matcher), None);
        assert_eq!(buf.discard(), 4);
        assert!(buf.pending().is_empty());
    }

    fn dollar_prompt() -> PromptMatcher {
        PromptMatcher::new(&[prompt(PromptTag::Command, "$ ", PatternKind::Glob)]).unwrap()
    }

    #[test]
    fn test_prompt_inside_echo_is_skipped() {
        let matcher = dollar_prompt();
        let command = b"echo 'cost$ 5' | tr -d '$'";
        let mut buf = ExpectBuffer::new(256);
        buf.expect_echo(command);

        // echo still arriving: no match even though it holds "$ "
        buf.push(b"echo 'cost$ 5");
        assert_eq!(buf.try_match(&matcher), None);

        buf.push(b"' | tr -d '$'\r\ncost 5\n$ ");
        assert_eq!(buf.try_match(&matcher), Some(0));
        assert_eq!(buf.before_match(), b"echo 'cost$ 5' | tr -d '$'\r\ncost 5\n");
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn test_missing_echo_falls_back_to_plain_search() {
        let matcher = dollar_prompt();
        let mut buf = ExpectBuffer::new(256);
        buf.expect_echo(b"secret");
        buf.push(b"ok\n$ ");
        assert_eq!(buf.try_match(&matcher), Some(0));
        assert_eq!(buf.before_match(), b"ok\n");

        // an echo that stalls halfway can be given up on
        buf.expect_echo(b"echo 'a$ b'");
        buf.push(b"echo 'a$ ");
        assert_eq!(buf.try_match(&matcher), None);
        buf.abandon_echo();
        assert_eq!(buf.try_match(&matcher), Some(0));
        assert_eq!(buf.before_match(), b"echo 'a");
    }

    #[test]
    fn test_matcher_keeps_table() {
        let matcher = PromptMatcher::new(&[
            prompt(PromptTag::Command, "$ ", PatternKind::Glob),
            prompt(PromptTag::Password, "assword:", PatternKind::Glob),
        ])
        .unwrap();
        assert_eq!(matcher.len(), 2);
        assert_eq!(matcher.tag(1), Some(PromptTag::Password));
        assert_eq!(matcher.tag(2), None);
    }

    #[test]
    fn test_buffer_full() {
        let mut buf = ExpectBuffer::new(4);
        buf.push(b"abc");
        assert!(!buf.is_full());
        buf.push(b"d");
        assert!(buf.is_full());
    }
}
