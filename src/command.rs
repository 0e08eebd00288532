use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

use nix::sys::personality;
use nix::sys::ptrace;
use nix::unistd::{execvpe, fork, ForkResult, Pid};

/// Builder for a process launched under trace. The child requests tracing
/// of itself before exec, so it stops before its first instruction runs.
#[derive(Debug, Clone)]
pub struct Command {
    path: OsString,
    args: Vec<OsString>,
    envs: Vec<OsString>,
    aslr: bool,
}

impl Command {
    pub fn new<P: AsRef<OsStr>>(command: P) -> Self {
        let path = command.as_ref().to_owned();
        Self {
            args: vec![path.clone()],
            envs: Vec::new(),
            path,
            aslr: true,
        }
    }

    pub fn command(&self) -> &OsStr {
        &self.path
    }

    pub fn disable_aslr(&mut self) -> &mut Self {
        self.aslr = false;
        self
    }

    pub fn arg<A: AsRef<OsStr>>(&mut self, arg: A) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<A: AsRef<OsStr>, I: IntoIterator<Item = A>>(&mut self, args: I) -> &mut Self {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(&mut self, key: K, val: V) -> &mut Self {
        let mut kv = key.as_ref().to_owned();
        kv.push("=");
        kv.push(val.as_ref());
        self.envs.push(kv);
        self
    }

    pub fn inherit_env(&mut self) -> &mut Self {
        for (k, v) in env::vars_os() {
            self.env(k, v);
        }
        self
    }

    pub fn launch(&self) -> nix::Result<Pid> {
        if let ForkResult::Parent { child } = unsafe { fork() }? {
            return Ok(child);
        }

        if !self.aslr {
            if let Ok(mut pers) = personality::get() {
                pers.insert(personality::Persona::ADDR_NO_RANDOMIZE);
                personality::set(pers).ok();
            }
        }

        if ptrace::traceme().is_err() {
            unsafe { libc::exit(libc::EXIT_FAILURE) }
        }

        let to_cstring = |os: &OsString| CString::new(os.as_bytes()).ok();

        let path = to_cstring(&self.path);
        let args = self.args.iter().map(to_cstring).collect::<Option<Vec<_>>>();
        let envs = self.envs.iter().map(to_cstring).collect::<Option<Vec<_>>>();

        if let (Some(path), Some(args), Some(envs)) = (path, args, envs) {
            execvpe(path.as_ref(), args.as_ref(), envs.as_ref()).ok();
        }

        unsafe { libc::exit(libc::EXIT_FAILURE) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_starts_with_the_command() {
        let mut cmd = Command::new("/bin/true");
        cmd.arg("-x").args(["a", "b"]);
        assert_eq!(cmd.command(), OsStr::new("/bin/true"));
        assert_eq!(cmd.args.len(), 4);
    }

    #[test]
    fn env_formatting() {
        let mut cmd = Command::new("/bin/true");
        cmd.env("KEY", "value");
        assert_eq!(cmd.envs, vec![OsString::from("KEY=value")]);
    }
}
