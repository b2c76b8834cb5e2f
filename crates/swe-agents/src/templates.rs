//! Protocol templates and renderers
//!
//! The tool protocol: exactly one triple-backtick bash block per
//! assistant message, or the submit sentinel to end the run. Template
//! bodies are value-level strings; the renderers below substitute the
//! handful of variables and implement the long-output elision.

use std::sync::LazyLock;

use regex::Regex;

/// The literal command output that terminates a run as "Submitted".
pub const SUBMIT_SENTINEL: &str = "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT";

/// Outputs at or above this length are elided to head + tail.
const OUTPUT_ELIDE_THRESHOLD: usize = 10_000;
const OUTPUT_HEAD: usize = 5_000;
const OUTPUT_TAIL: usize = 5_000;

/// Steps remaining at which the submit reminder escalates.
const LAST_MILE_STEPS: u32 = 5;

static BASH_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```bash\s*\n(.*?)\n```").unwrap());

pub const SYSTEM_TEMPLATE: &str = "\
You are a helpful assistant that can interact with a computer.

Your response must contain exactly ONE bash code block with ONE command (or commands connected with && or ||).
Include a THOUGHT section before your command where you explain your reasoning process.
Format your response as shown in <format_example>.

<format_example>
Your reasoning and analysis here. Explain why you want to perform the action.

```bash
your_command_here
```
</format_example>

After each command result, briefly reflect on what you learned and whether it moved you closer to solving the issue.
Keep iterating until you have verified the fix works. Do not submit prematurely.

Failure to follow these rules will cause your response to be rejected.
";

const INSTANCE_TEMPLATE: &str = "\
Please solve this issue: {{task}}

You can execute bash commands and edit files to implement the necessary changes.

## Quality Requirements (Critical)

1. Minimal Scope: ONLY modify files directly related to the failing behavior.
2. No Public API Changes: Avoid changing public function or class signatures.
3. Test First: Reproduce the issue before editing code.
4. Targeted Fixes: Prefer the smallest change that resolves the issue.
5. No Repetition: If an edit command fails repeatedly, switch strategy.
6. Self-Check Before Submit:
   - No accidental signature changes
   - No duplicated code blocks
   - No placeholder/incomplete code

## Critical: Working Directory and File Location

<important>
- Your current working directory IS the cloned repository. Use `pwd` to confirm.
- NEVER hardcode paths like `/Users/runner/...` or `/opt/miniconda3/...`.
- NEVER try `python3 -c \"import <package>\"` — the package is unbuilt source code, not installed.
- To find files: `grep -r \"pattern\" . --include=\"*.py\" -l`
- To read source: use `cat`, `head`, or `sed -n 'START,ENDp'` directly.
- Start with `ls` and `find . -type f -name \"*.py\" | head -20`.
</important>

## Recommended Workflow

1. Run pwd and ls to orient yourself. Use grep -r \"keyword\" . --include=\"*.py\" -l to find relevant files. NEVER import the package.
2. Create a script to reproduce the issue
3. Edit the source code to resolve the issue
4. Verify your fix works by running your script again
5. Test edge cases to ensure your fix is robust
6. Submit your changes and finish your work by issuing the following command: `echo COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT`.
   Do not combine it with any other command. <important>After this command, you cannot continue working on this task.</important>

## Important Rules

1. Every response must contain exactly one action
2. The action must be enclosed in triple backticks
3. Directory or environment variable changes are not persistent. Every action is executed in a new subshell.
   However, you can prefix any action with `MY_ENV_VAR=MY_VALUE cd /path/to/working/dir && ...` or write/load environment variables from files

<system_information>
{{system}}
</system_information>

## Formatting your response

Here is an example of a correct response:

<example_response>
THOUGHT: I need to understand the structure of the repository first. Let me check what files are in the current directory to get a better understanding of the codebase.

```bash
ls -la
```
</example_response>

## Common Pitfalls

- NEVER import the package (`python3 -c \"import ...\"`) — it is unbuilt source. Use cat/grep.
- NEVER search in /opt/, /usr/lib/, or site-packages/ — the code is in the current directory.
- If a command fails, try a DIFFERENT approach instead of repeating it.

## Editing Files

Use `python3 -c \"import pathlib; p = pathlib.Path('file.py'); c = p.read_text(); c = c.replace('old', 'new'); p.write_text(c); print('Done')\"` for edits.
{{sed_advice}}
View lines: `nl -ba file.py | sed -n '10,20p'`
";

const TDD_APPENDIX: &str = "
## Additional Requirement: Test-Driven Development

Before fixing the code, you MUST:
1. Write a failing test that reproduces the issue
2. Run it to confirm it fails
3. Then fix the code
4. Re-run the test to confirm it passes

Use existing test frameworks (pytest, unittest) found in the repository.
";

/// Render the instance prompt for one task.
pub fn render_instance(task: &str, tdd_mode: bool) -> String {
    let sed_advice = if std::env::consts::OS == "macos" {
        "For sed on MacOS: `sed -i '' 's/old/new/g' file.py` (note space after -i)."
    } else {
        "For sed: `sed -i 's/old/new/g' file.py`"
    };
    let system_info = format!("{} {}", std::env::consts::OS, std::env::consts::ARCH);

    let mut rendered = INSTANCE_TEMPLATE
        .replace("{{task}}", task)
        .replace("{{system}}", &system_info)
        .replace("{{sed_advice}}", sed_advice);
    if tdd_mode {
        rendered.push_str(TDD_APPENDIX);
    }
    rendered
}

/// Byte offset of the largest char boundary at or below `limit`.
fn boundary_at(s: &str, limit: usize) -> usize {
    if s.len() <= limit {
        return s.len();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Byte offset of the smallest char boundary keeping at most `limit`
/// trailing bytes.
fn tail_boundary(s: &str, limit: usize) -> usize {
    if s.len() <= limit {
        return 0;
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    start
}

/// Render a command observation, eliding oversized output.
pub fn build_observation(
    returncode: i32,
    output: &str,
    n_model_calls: u32,
    step_limit: u32,
) -> String {
    let mut obs = format!("<returncode>{returncode}</returncode>\n");

    if output.len() < OUTPUT_ELIDE_THRESHOLD {
        obs.push_str(&format!("<output>\n{output}</output>\n"));
    } else {
        let head_end = boundary_at(output, OUTPUT_HEAD);
        let tail_start = tail_boundary(output, OUTPUT_TAIL);
        let elided = output.len() - head_end - (output.len() - tail_start);
        obs.push_str(
            "<warning>\nThe output of your last command was too long.\n\
             Please try a different command that produces less output.\n\
             If you're looking at a file you can try use head, tail or sed to view a smaller number of lines selectively.\n\
             If you're using grep or find and it produced too much output, you can use a more selective search pattern.\n\
             If you really need to see something from the full command's output, you can redirect output to a file and then search in that file.\n\
             </warning>\n",
        );
        obs.push_str(&format!("<output_head>\n{}\n</output_head>\n", &output[..head_end]));
        obs.push_str(&format!("<elided_chars>\n{elided} characters elided\n</elided_chars>\n"));
        obs.push_str(&format!("<output_tail>\n{}\n</output_tail>\n", &output[tail_start..]));
    }

    obs.push_str(&format!("<step>{n_model_calls}/{step_limit}</step>"));
    if n_model_calls + LAST_MILE_STEPS >= step_limit {
        obs.push_str(&format!(
            " <warning>You are almost out of steps. Submit now with: echo {SUBMIT_SENTINEL}</warning>"
        ));
    }
    obs.push_str(&format!(
        "\n<reminder>When done, submit with ONLY this command (no other commands): echo {SUBMIT_SENTINEL}</reminder>"
    ));
    obs
}

/// Render the observation for a command that hit its deadline.
pub fn build_timeout_observation(action: &str, output: &str) -> String {
    let body = if output.len() < OUTPUT_ELIDE_THRESHOLD {
        format!("<output>\n{output}\n</output>")
    } else {
        let head_end = boundary_at(output, OUTPUT_HEAD);
        let tail_start = tail_boundary(output, OUTPUT_TAIL);
        format!(
            "<warning>Output was too long and has been truncated.</warning>\n\
             <output_head>\n{}\n</output_head>\n\
             <output_tail>\n{}\n</output_tail>",
            &output[..head_end],
            &output[tail_start..]
        )
    };
    format!(
        "The last command <command>{action}</command> timed out and has been killed.\n\
         The output of the command was:\n{body}\n\
         Please try another command and make sure to avoid those requiring interactive input."
    )
}

/// Render the response to a malformed assistant message.
pub fn build_format_error(n_actions: usize) -> String {
    format!(
        "Please always provide EXACTLY ONE action in triple backticks, found {n_actions} actions.\n\
         If you want to end the task, please issue the following command: `echo {SUBMIT_SENTINEL}`\n\
         without any other command.\n\
         Else, please format your response exactly as follows:\n\n\
         <response_example>\n\
         Here are some thoughts about why you want to perform the action.\n\n\
         ```bash\n\
         <action>\n\
         ```\n\
         </response_example>\n\n\
         Note: In rare cases, if you need to reference a similar format in your command, you might have\n\
         to proceed in two steps, first writing TRIPLEBACKTICKSBASH, then replacing them with ```bash."
    )
}

/// All fenced bash blocks in an assistant message.
pub fn extract_bash_blocks(content: &str) -> Vec<String> {
    BASH_BLOCK_RE
        .captures_iter(content)
        .map(|c| c[1].trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_instance_substitutes_task() {
        let rendered = render_instance("Fix divide by zero in div()", false);
        assert!(rendered.contains("Please solve this issue: Fix divide by zero in div()"));
        assert!(!rendered.contains("{{task}}"));
        assert!(!rendered.contains("{{system}}"));
        assert!(!rendered.contains("Test-Driven Development"));
    }

    #[test]
    fn test_render_instance_tdd_appendix() {
        let rendered = render_instance("Fix it", true);
        assert!(rendered.contains("Test-Driven Development"));
        assert!(rendered.contains("Write a failing test"));
    }

    #[test]
    fn test_observation_short_output() {
        let obs = build_observation(0, "hello\n", 3, 30);
        assert!(obs.starts_with("<returncode>0</returncode>"));
        assert!(obs.contains("<output>\nhello\n</output>"));
        assert!(obs.contains("<step>3/30</step>"));
        assert!(!obs.contains("almost out of steps"));
        assert!(obs.contains("<reminder>"));
    }

    #[test]
    fn test_observation_elides_long_output() {
        let long = "x".repeat(20_000);
        let obs = build_observation(0, &long, 3, 30);
        assert!(obs.contains("<output_head>"));
        assert!(obs.contains("<output_tail>"));
        assert!(obs.contains("10000 characters elided"));
        assert!(!obs.contains("<output>\nx"));
    }

    #[test]
    fn test_observation_last_mile_warning() {
        let obs = build_observation(0, "ok", 26, 30);
        assert!(obs.contains("almost out of steps"));
        let obs = build_observation(0, "ok", 24, 30);
        assert!(!obs.contains("almost out of steps"));
    }

    #[test]
    fn test_format_error_mentions_exactly_one_action() {
        let msg = build_format_error(2);
        assert!(msg.contains("EXACTLY ONE action"));
        assert!(msg.contains("found 2 actions"));
    }

    #[test]
    fn test_timeout_observation_mentions_timed_out() {
        let obs = build_timeout_observation("sleep 999", "partial");
        assert!(obs.contains("timed out"));
        assert!(obs.contains("sleep 999"));
        assert!(obs.contains("partial"));
    }

    #[test]
    fn test_extract_bash_blocks() {
        let content = "THOUGHT: try this\n\n```bash\nls -la\n```";
        assert_eq!(extract_bash_blocks(content), vec!["ls -la"]);

        let two = "```bash\nls\n```\nand\n```bash\npwd\n```";
        assert_eq!(extract_bash_blocks(two).len(), 2);

        assert!(extract_bash_blocks("no blocks here").is_empty());
    }
}
