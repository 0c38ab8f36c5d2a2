pub struct ExecRequest<'a> {
    pub cmd: &'a str,
    pub workdir: &'a str,
}

/// Combined stdout/stderr of a finished command.
pub struct ExecOutput {
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}
