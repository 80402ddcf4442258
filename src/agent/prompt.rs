pub const EXECUTION_PROTOCOL: &str = r#"Code execution protocol:
1) To run Python, put it in a fenced block tagged python (```python ... ```). Every such block in your reply is executed in order.
2) The Python session is persistent: variables you define stay available in later blocks and later turns.
3) After your code runs you receive a message starting with "Execution results:" that contains stdout, stderr, tables, values, charts and errors.
4) If execution fails, read the error and reply with corrected code.
5) Only numbers that appear in execution results are facts. Do not invent values.
6) When you can answer, reply without any python block. That reply is your final answer."#;

/// Variant prompt followed by the execution protocol and the names pre-bound in the sandbox.
pub fn compose_system_prompt(variant_prompt: &str, bindings: &[String]) -> String {
    let mut prompt = variant_prompt.trim_end().to_string();
    if !prompt.is_empty() {
        prompt.push_str("\n\n");
    }
    prompt.push_str(EXECUTION_PROTOCOL);

    if !bindings.is_empty() {
        prompt.push_str("\n\nAlready defined in the session: ");
        prompt.push_str(&bindings.join(", "));
        prompt.push('.');
        if bindings.iter().any(|name| name == "records") {
            prompt.push_str(
                "\n`records` is a tuple of read-only row mappings keyed by column name; numeric columns are numbers.",
            );
        }
        if bindings.iter().any(|name| name == "df") {
            prompt.push_str(
                "\n`df` is a scratch pandas DataFrame copy of the same rows: edits to it stay in this session and never change `records`.",
            );
        }
    }

    prompt
}
