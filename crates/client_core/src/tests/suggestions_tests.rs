use super::*;

fn commands() -> Vec<Command> {
    ["giphy", "giveaway", "mute"]
        .into_iter()
        .map(|name| Command {
            name: name.to_owned(),
            args_hint: "[text]".to_owned(),
            description: None,
        })
        .collect()
}

fn members() -> Vec<User> {
    [("u1", "Alice Smith"), ("u2", "Bob"), ("u3", "alicia")]
        .into_iter()
        .map(|(id, name)| User {
            user_id: UserId::from(id),
            display_name: name.to_owned(),
            online: false,
        })
        .collect()
}

fn resolver() -> CommandMentionResolver {
    CommandMentionResolver::new('/', '@')
}

fn names(suggestions: &Option<Suggestions>) -> Vec<String> {
    suggestions
        .iter()
        .flat_map(|s| s.candidates.iter())
        .map(|candidate| match candidate {
            Candidate::Command { name, .. } => name.clone(),
            Candidate::Mention { display_name, .. } => display_name.clone(),
        })
        .collect()
}

#[test]
fn lone_prefix_opens_full_command_list() {
    let members = members();
    let result = resolver().resolve("/", &commands(), &members);
    assert_eq!(result.as_ref().map(|s| s.kind), Some(SuggestionKind::Command));
    assert_eq!(names(&result), vec!["giphy", "giveaway", "mute"]);
}

#[test]
fn filters_commands_by_substring() {
    let members = members();
    let r = resolver();

    assert_eq!(
        names(&r.resolve("/gi", &commands(), &members)),
        vec!["giphy", "giveaway"]
    );
    assert_eq!(names(&r.resolve("/gip", &commands(), &members)), vec!["giphy"]);
    assert_eq!(names(&r.resolve("/way", &commands(), &members)), vec!["giveaway"]);
    // Neither name contains "gif", so the picker closes.
    assert_eq!(r.resolve("/gif", &commands(), &members), None);
}

#[test]
fn command_with_arguments_closes_picker() {
    let members = members();
    assert_eq!(
        resolver().resolve("/giphy cats", &commands(), &members),
        None
    );
}

#[test]
fn trailing_trigger_opens_full_member_list() {
    let members = members();
    let result = resolver().resolve("hey @", &commands(), &members);
    assert_eq!(result.as_ref().map(|s| s.kind), Some(SuggestionKind::Mention));
    assert_eq!(names(&result), vec!["Alice Smith", "Bob", "alicia"]);
}

#[test]
fn filters_members_case_insensitively_on_last_fragment() {
    let members = members();
    let result = resolver().resolve("@bob and @ALI", &commands(), &members);
    assert_eq!(names(&result), vec!["Alice Smith", "alicia"]);
}

#[test]
fn plain_text_has_no_suggestions() {
    let members = members();
    assert_eq!(resolver().resolve("hello there", &commands(), &members), None);
    assert_eq!(resolver().resolve("", &commands(), &members), None);
}

#[test]
fn empty_command_list_yields_nothing() {
    let members = members();
    assert_eq!(resolver().resolve("/", &[], &members), None);
}

#[test]
fn applying_command_rewrites_whole_text() {
    let edit = resolver().apply_command(&commands()[0].name);
    assert_eq!(edit.text, "/giphy ");
    assert_eq!(edit.cursor, 7);
}

#[test]
fn applying_mention_keeps_preceding_text() {
    let edit = resolver().apply_mention("thanks @ali", "Alice Smith");
    assert_eq!(edit.text, "thanks @Alice Smith ");
    assert_eq!(edit.cursor, edit.text.chars().count());

    let edit = resolver().apply_mention("ping @", "Bob");
    assert_eq!(edit.text, "ping @Bob ");
}

#[test]
fn chosen_mention_no_longer_matches() {
    let members = members();
    let edit = resolver().apply_mention("hi @bo", "Bob");
    assert_eq!(resolver().resolve(&edit.text, &commands(), &members), None);
}
